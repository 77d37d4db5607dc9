//! Call acoustic context analysis
//!
//! Classifies the acoustic environment of a call from its accumulated
//! statistics so the VAD can scale its base threshold per call.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::session::CallId;

/// Acoustic environment of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallEnvironment {
    Quiet,
    Noisy,
    Mobile,
    Conference,
    Unknown,
}

impl CallEnvironment {
    /// Multiplier applied to the configured base energy threshold
    pub fn threshold_multiplier(&self) -> f32 {
        match self {
            CallEnvironment::Quiet => 0.8,
            CallEnvironment::Noisy => 1.5,
            CallEnvironment::Mobile => 1.2,
            CallEnvironment::Conference => 1.3,
            CallEnvironment::Unknown => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallEnvironment::Quiet => "quiet",
            CallEnvironment::Noisy => "noisy",
            CallEnvironment::Mobile => "mobile",
            CallEnvironment::Conference => "conference",
            CallEnvironment::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CallEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One caller utterance as seen by the VAD
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechEvent {
    pub duration: Duration,
    pub mean_energy: f32,
}

/// Frame-level statistics supplied by the VAD for classification
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AcousticSnapshot {
    pub frames: u64,
    /// Mean energy of non-speech frames
    pub noise_level: f32,
    /// Fraction of frames classified as speech
    pub speech_ratio: f32,
}

/// Result of analyzing a call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CallContext {
    pub environment: CallEnvironment,
    /// Composite quality score in [0, 1]
    pub quality_score: f32,
    pub interruption_rate: f32,
    pub turns: u32,
    pub interruptions: u32,
}

#[derive(Debug, Default)]
struct ContextStats {
    interruptions: u32,
    turns: u32,
    speech_events: VecDeque<SpeechEvent>,
}

/// Per-call accumulator and environment classifier
#[derive(Debug)]
pub struct CallContextAnalyzer {
    calls: DashMap<CallId, ContextStats>,
    max_speech_events: usize,
    min_frames: u64,
}

impl CallContextAnalyzer {
    /// `min_frames` is the number of frames needed before a call is classified
    pub fn new(max_speech_events: usize, min_frames: u64) -> Self {
        Self {
            calls: DashMap::new(),
            max_speech_events,
            min_frames,
        }
    }

    pub fn record_interruption(&self, call_id: &CallId) {
        self.calls.entry(call_id.clone()).or_default().interruptions += 1;
    }

    pub fn record_turn(&self, call_id: &CallId) {
        self.calls.entry(call_id.clone()).or_default().turns += 1;
    }

    /// Append an utterance, evicting the oldest once the cap is reached
    pub fn record_speech_event(&self, call_id: &CallId, event: SpeechEvent) {
        let mut stats = self.calls.entry(call_id.clone()).or_default();
        if self.max_speech_events == 0 {
            return;
        }
        while stats.speech_events.len() >= self.max_speech_events {
            stats.speech_events.pop_front();
        }
        stats.speech_events.push_back(event);
    }

    pub fn speech_events(&self, call_id: &CallId) -> Vec<SpeechEvent> {
        self.calls
            .get(call_id)
            .map(|s| s.speech_events.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Classify a call and score its quality
    pub fn analyze(&self, call_id: &CallId, snapshot: AcousticSnapshot) -> CallContext {
        let (interruptions, turns) = self
            .calls
            .get(call_id)
            .map(|s| (s.interruptions, s.turns))
            .unwrap_or((0, 0));
        let interruption_rate = interruptions as f32 / turns.max(1) as f32;

        let environment = if snapshot.frames < self.min_frames {
            CallEnvironment::Unknown
        } else {
            Self::classify(snapshot.noise_level, snapshot.speech_ratio, interruption_rate)
        };

        CallContext {
            environment,
            quality_score: Self::quality_score(snapshot.noise_level, snapshot.speech_ratio, interruption_rate),
            interruption_rate,
            turns,
            interruptions,
        }
    }

    /// Threshold decision tree over (noise level, speech ratio, interruption rate)
    pub fn classify(noise_level: f32, speech_ratio: f32, interruption_rate: f32) -> CallEnvironment {
        if interruption_rate > 0.5 && speech_ratio > 0.5 {
            CallEnvironment::Conference
        } else if noise_level > 0.05 {
            CallEnvironment::Noisy
        } else if noise_level > 0.02 {
            CallEnvironment::Mobile
        } else if noise_level <= 0.01 {
            CallEnvironment::Quiet
        } else {
            CallEnvironment::Unknown
        }
    }

    fn quality_score(noise_level: f32, speech_ratio: f32, interruption_rate: f32) -> f32 {
        let cleanliness = 1.0 - (noise_level / 0.1).clamp(0.0, 1.0);
        let calmness = 1.0 - interruption_rate.clamp(0.0, 1.0);
        let balance = 1.0 - ((speech_ratio.clamp(0.0, 1.0) - 0.5).abs() * 2.0);
        (cleanliness * 0.5 + calmness * 0.3 + balance * 0.2).clamp(0.0, 1.0)
    }

    /// Drop everything known about a call
    pub fn reset_call(&self, call_id: &CallId) {
        self.calls.remove(call_id);
    }

    pub fn tracked_calls(&self) -> usize {
        self.calls.len()
    }
}
