//! Metrics sink for operational observability
//!
//! Components report through an injected [`MetricsSink`] instead of a process
//! global registry. Labels are fleet-scoped (`state`, `result`, `reason`,
//! `environment`); call ids are never used as label values.

use std::collections::BTreeMap;
use std::fmt::Debug;

use parking_lot::Mutex;

/// Gauge: calls with TTS gating active
pub const TTS_GATING_ACTIVE: &str = "voice_bridge_tts_gating_active";
/// Gauge: calls with audio capture enabled
pub const AUDIO_CAPTURE_ENABLED: &str = "voice_bridge_audio_capture_enabled";
/// Gauge: calls per conversation state (label `state`)
pub const CALLS_BY_STATE: &str = "voice_bridge_calls_by_state";
/// Counter: barge-in attempts (at most one per gating episode)
pub const BARGE_IN_ATTEMPTS: &str = "voice_bridge_barge_in_attempts_total";
/// Counter: gating episodes ended (label `reason`)
pub const TTS_EPISODES: &str = "voice_bridge_tts_episodes_total";
/// Counter: VAD frames processed (label `result`)
pub const VAD_FRAMES: &str = "voice_bridge_vad_frames_total";
/// Observation: VAD frame confidence
pub const VAD_CONFIDENCE: &str = "voice_bridge_vad_confidence";
/// Gauge: most recently computed adaptive energy threshold
pub const VAD_ADAPTIVE_THRESHOLD: &str = "voice_bridge_vad_adaptive_threshold";
/// Counter: capture fallbacks that force-enabled capture
pub const CAPTURE_FALLBACKS: &str = "voice_bridge_capture_fallback_total";

/// Label set attached to a metric sample
pub type Labels<'a> = &'a [(&'static str, &'a str)];

/// Destination for counters, gauges and observations
pub trait MetricsSink: Send + Sync + Debug {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, by: u64);

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _labels: Labels<'_>, _by: u64) {}

    fn set_gauge(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}

    fn observe(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
}

type SeriesKey = (&'static str, Vec<(&'static str, String)>);

fn series_key(name: &'static str, labels: Labels<'_>) -> SeriesKey {
    let mut labels: Vec<_> = labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
    labels.sort();
    (name, labels)
}

#[derive(Debug, Default)]
struct InMemorySeries {
    counters: BTreeMap<SeriesKey, u64>,
    gauges: BTreeMap<SeriesKey, f64>,
    observations: BTreeMap<SeriesKey, Vec<f64>>,
}

/// Sink that keeps every series in memory, for tests and local demos
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: Mutex<InMemorySeries>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented)
    pub fn counter(&self, name: &'static str, labels: Labels<'_>) -> u64 {
        self.series
            .lock()
            .counters
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across every label set
    pub fn counter_total(&self, name: &'static str) -> u64 {
        self.series
            .lock()
            .counters
            .iter()
            .filter(|((n, _), _)| *n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn gauge(&self, name: &'static str, labels: Labels<'_>) -> Option<f64> {
        self.series.lock().gauges.get(&series_key(name, labels)).copied()
    }

    pub fn observations(&self, name: &'static str, labels: Labels<'_>) -> Vec<f64> {
        self.series
            .lock()
            .observations
            .get(&series_key(name, labels))
            .cloned()
            .unwrap_or_default()
    }

    /// Every label value recorded for a label key of a metric
    pub fn label_values(&self, name: &'static str, key: &str) -> Vec<String> {
        let series = self.series.lock();
        let keys = series
            .counters
            .keys()
            .chain(series.gauges.keys())
            .chain(series.observations.keys());
        let mut values: Vec<String> = keys
            .filter(|(n, _)| *n == name)
            .flat_map(|(_, labels)| labels.iter().filter(|(k, _)| *k == key).map(|(_, v)| v.clone()))
            .collect();
        values.sort();
        values.dedup();
        values
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, by: u64) {
        *self.series.lock().counters.entry(series_key(name, labels)).or_insert(0) += by;
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.series.lock().gauges.insert(series_key(name, labels), value);
    }

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.series
            .lock()
            .observations
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }
}
