//! Voice Activity Detection (VAD)
//!
//! Per-call speech detection for caller audio. Each frame is scored from its
//! RMS energy and, for supported sample rates, a secondary classifier. The raw
//! decision then goes through frame smoothing so a single loud or quiet frame
//! cannot flip the speaking state.
//!
//! With adaptive mode on, every call keeps its own noise-floor estimate and
//! periodically re-classifies its acoustic environment to nudge its base
//! threshold. Per-call state is keyed by call id and never shared; it is only
//! touched from that call's audio path, so it lives outside the session store.

pub mod adaptive;
pub mod classifier;
pub mod context;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::audio::rms_energy;
use crate::error::{Result, VoiceBridgeError};
use crate::metrics::{self, MetricsSink, NoopMetrics};
use crate::session::CallId;

pub use adaptive::AdaptiveThreshold;
pub use classifier::{SpeechClassifier, ZeroCrossingClassifier};
pub use context::{AcousticSnapshot, CallContext, CallContextAnalyzer, CallEnvironment, SpeechEvent};

/// Confidence at or above which a frame counts as speech-like
const SPEECH_CONFIDENCE: f32 = 0.5;

/// Configuration for Voice Activity Detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Base energy threshold (normalized RMS, 0.0-1.0)
    pub energy_threshold: f32,
    /// Consecutive speech-like frames needed to enter the speaking state
    pub min_speech_frames: u32,
    /// Consecutive silence-like frames needed to leave the speaking state
    pub max_silence_frames: u32,
    /// Run the secondary classifier when the sample rate allows it
    pub classifier_enabled: bool,
    /// Sample rates the secondary classifier accepts
    pub supported_sample_rates: Vec<u32>,
    /// Track a per-call noise floor
    pub adaptive_enabled: bool,
    /// Noise samples kept per call
    pub adaptive_window: usize,
    /// Noise samples needed before the threshold adapts
    pub adaptive_min_samples: usize,
    /// Adaptive threshold never drops below this multiple of the noise floor
    pub noise_floor_multiplier: f32,
    /// Exponential blend factor toward the adaptive target (0-1]
    pub threshold_blend: f32,
    /// Frames between environment re-classification
    pub adaptation_interval_frames: u64,
    /// Minimum time between environment adaptations of one call (milliseconds)
    pub adaptation_cooldown_ms: u64,
    /// Blend factor when moving the base threshold to a new environment (0-1]
    pub base_blend: f32,
    /// Speech events kept per call by the context analyzer
    pub max_speech_events: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02,
            min_speech_frames: 3,
            max_silence_frames: 15, // 300ms at 20ms frames
            classifier_enabled: true,
            supported_sample_rates: vec![8000, 16000, 32000, 48000],
            adaptive_enabled: true,
            adaptive_window: 200,
            adaptive_min_samples: 20,
            noise_floor_multiplier: 2.5,
            threshold_blend: 0.1,
            adaptation_interval_frames: 250, // 5s at 20ms frames
            adaptation_cooldown_ms: 10_000,
            base_blend: 0.3,
            max_speech_events: 100,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.energy_threshold > 0.0 && self.energy_threshold < 1.0) {
            return Err(VoiceBridgeError::config("VAD energy_threshold must be between 0.0 and 1.0"));
        }
        if self.min_speech_frames == 0 {
            return Err(VoiceBridgeError::config("VAD min_speech_frames must be greater than 0"));
        }
        if self.max_silence_frames == 0 {
            return Err(VoiceBridgeError::config("VAD max_silence_frames must be greater than 0"));
        }
        if self.adaptive_enabled {
            if self.adaptive_min_samples == 0 || self.adaptive_window < self.adaptive_min_samples {
                return Err(VoiceBridgeError::config(
                    "VAD adaptive_window must be at least adaptive_min_samples (and both non-zero)",
                ));
            }
            if self.noise_floor_multiplier < 1.0 {
                return Err(VoiceBridgeError::config("VAD noise_floor_multiplier must be at least 1.0"));
            }
            if self.adaptation_interval_frames == 0 {
                return Err(VoiceBridgeError::config("VAD adaptation_interval_frames must be greater than 0"));
            }
        }
        for (name, value) in [("threshold_blend", self.threshold_blend), ("base_blend", self.base_blend)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(VoiceBridgeError::config(format!("VAD {} must be in (0, 1]", name)));
            }
        }
        Ok(())
    }

    pub fn adaptation_cooldown(&self) -> Duration {
        Duration::from_millis(self.adaptation_cooldown_ms)
    }

    fn adaptive_threshold(&self) -> AdaptiveThreshold {
        AdaptiveThreshold::new(
            self.energy_threshold,
            self.adaptive_window,
            self.adaptive_min_samples,
            self.noise_floor_multiplier,
            self.threshold_blend,
        )
    }
}

/// Result of voice activity detection for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadResult {
    /// Smoothed speaking state after this frame
    pub is_speech: bool,
    /// Confidence score (0.0-1.0)
    pub confidence: f32,
    /// RMS energy of the frame (0.0-1.0)
    pub energy_level: f32,
    /// Energy threshold applied to this frame
    pub threshold: f32,
    /// Unsmoothed decision for this frame alone
    pub frame_speech: bool,
    /// Whether the secondary classifier contributed
    pub classifier_used: bool,
}

#[derive(Debug)]
struct CallVadState {
    frames: u64,
    speech_frames: u64,
    silence_frames: u64,
    consecutive_speech: u32,
    consecutive_silence: u32,
    speaking: bool,
    utterance_duration: Duration,
    utterance_energy_sum: f64,
    utterance_frames: u64,
    noise_energy_sum: f64,
    noise_frames: u64,
    adaptive: Option<AdaptiveThreshold>,
    last_adaptation: Option<Instant>,
    environment: CallEnvironment,
}

impl CallVadState {
    fn new(config: &VadConfig) -> Self {
        Self {
            frames: 0,
            speech_frames: 0,
            silence_frames: 0,
            consecutive_speech: 0,
            consecutive_silence: 0,
            speaking: false,
            utterance_duration: Duration::ZERO,
            utterance_energy_sum: 0.0,
            utterance_frames: 0,
            noise_energy_sum: 0.0,
            noise_frames: 0,
            adaptive: config.adaptive_enabled.then(|| config.adaptive_threshold()),
            last_adaptation: None,
            environment: CallEnvironment::Unknown,
        }
    }

    fn threshold(&self, config: &VadConfig) -> f32 {
        self.adaptive
            .as_ref()
            .map(|a| a.current())
            .unwrap_or(config.energy_threshold)
    }

    fn snapshot(&self) -> AcousticSnapshot {
        AcousticSnapshot {
            frames: self.frames,
            noise_level: if self.noise_frames > 0 {
                (self.noise_energy_sum / self.noise_frames as f64) as f32
            } else {
                0.0
            },
            speech_ratio: if self.frames > 0 {
                self.speech_frames as f32 / self.frames as f32
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of one call's VAD state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallVadStatus {
    pub frames: u64,
    pub speech_frames: u64,
    pub silence_frames: u64,
    pub speaking: bool,
    pub threshold: f32,
    pub base_threshold: f32,
    pub environment: CallEnvironment,
}

/// Per-call voice activity detection
#[derive(Debug)]
pub struct VadManager {
    config: VadConfig,
    classifier: Option<Arc<dyn SpeechClassifier>>,
    calls: DashMap<CallId, CallVadState>,
    analyzer: CallContextAnalyzer,
    metrics: Arc<dyn MetricsSink>,
}

impl VadManager {
    /// Create a VAD with the default zero-crossing classifier
    pub fn new(config: VadConfig) -> Result<Self> {
        Self::with_components(config, Some(Arc::new(ZeroCrossingClassifier::default())), Arc::new(NoopMetrics))
    }

    /// Create a VAD with an explicit classifier (or none) and metrics sink
    pub fn with_components(
        config: VadConfig,
        classifier: Option<Arc<dyn SpeechClassifier>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        debug!(
            energy_threshold = config.energy_threshold,
            adaptive = config.adaptive_enabled,
            classifier = ?classifier.as_ref().map(|c| c.name()),
            "Creating VadManager"
        );

        let analyzer = CallContextAnalyzer::new(config.max_speech_events, config.adaptation_interval_frames);
        Ok(Self {
            config,
            classifier,
            calls: DashMap::new(),
            analyzer,
            metrics,
        })
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &CallContextAnalyzer {
        &self.analyzer
    }

    /// Score one frame of caller audio for a call
    pub fn process_frame(&self, call_id: &CallId, frame: &[i16], sample_rate: u32) -> VadResult {
        let mut state = self
            .calls
            .entry(call_id.clone())
            .or_insert_with(|| CallVadState::new(&self.config));

        let energy = rms_energy(frame);
        let threshold = state.threshold(&self.config);

        let classifier_decision = match &self.classifier {
            Some(classifier)
                if self.config.classifier_enabled
                    && self.config.supported_sample_rates.contains(&sample_rate) =>
            {
                Some(classifier.is_speech(frame, sample_rate))
            }
            _ => None,
        };
        let (frame_speech, confidence) = combine(energy, threshold, classifier_decision);

        // Frame smoothing
        let was_speaking = state.speaking;
        if frame_speech {
            state.consecutive_speech += 1;
            state.consecutive_silence = 0;
            if !state.speaking && state.consecutive_speech >= self.config.min_speech_frames {
                state.speaking = true;
            }
        } else {
            state.consecutive_silence += 1;
            state.consecutive_speech = 0;
            if state.speaking && state.consecutive_silence >= self.config.max_silence_frames {
                state.speaking = false;
            }
        }

        state.frames += 1;
        if state.speaking {
            state.speech_frames += 1;
            if sample_rate > 0 {
                state.utterance_duration += Duration::from_secs_f64(frame.len() as f64 / sample_rate as f64);
            }
            state.utterance_energy_sum += energy as f64;
            state.utterance_frames += 1;
        } else {
            state.silence_frames += 1;
        }

        if !frame_speech && !state.speaking {
            state.noise_energy_sum += energy as f64;
            state.noise_frames += 1;
            if let Some(adaptive) = state.adaptive.as_mut() {
                let updated = adaptive.observe_noise(energy);
                self.metrics
                    .set_gauge(metrics::VAD_ADAPTIVE_THRESHOLD, &[], updated as f64);
            }
        }

        if was_speaking && !state.speaking {
            let event = SpeechEvent {
                duration: state.utterance_duration,
                mean_energy: (state.utterance_energy_sum / state.utterance_frames.max(1) as f64) as f32,
            };
            state.utterance_duration = Duration::ZERO;
            state.utterance_energy_sum = 0.0;
            state.utterance_frames = 0;
            self.analyzer.record_speech_event(call_id, event);
            self.analyzer.record_turn(call_id);
            debug!(call_id = %call_id, duration_ms = event.duration.as_millis() as u64, "Caller turn ended");
        }

        if state.adaptive.is_some() && state.frames % self.config.adaptation_interval_frames == 0 {
            self.adapt_environment(call_id, &mut state);
        }

        let result = VadResult {
            is_speech: state.speaking,
            confidence,
            energy_level: energy,
            threshold,
            frame_speech,
            classifier_used: classifier_decision.is_some(),
        };
        drop(state);

        let label = if result.is_speech { "speech" } else { "silence" };
        self.metrics.increment_counter(metrics::VAD_FRAMES, &[("result", label)], 1);
        self.metrics.observe(metrics::VAD_CONFIDENCE, &[], confidence as f64);

        trace!(
            call_id = %call_id,
            energy = energy,
            threshold = threshold,
            confidence = confidence,
            speech = result.is_speech,
            "VAD frame"
        );
        result
    }

    fn adapt_environment(&self, call_id: &CallId, state: &mut CallVadState) {
        let now = Instant::now();
        if let Some(last) = state.last_adaptation {
            if now.duration_since(last) < self.config.adaptation_cooldown() {
                return;
            }
        }

        let context = self.analyzer.analyze(call_id, state.snapshot());
        let Some(adaptive) = state.adaptive.as_mut() else {
            return;
        };

        let target_base = self.config.energy_threshold * context.environment.threshold_multiplier();
        let base = adaptive.base() * (1.0 - self.config.base_blend) + target_base * self.config.base_blend;
        adaptive.set_base(base);
        state.environment = context.environment;
        state.last_adaptation = Some(now);

        debug!(
            call_id = %call_id,
            environment = %context.environment,
            quality = context.quality_score,
            base_threshold = base,
            "VAD adapted to call environment"
        );
    }

    /// Count a caller interruption toward the call's context statistics
    pub fn record_interruption(&self, call_id: &CallId) {
        self.analyzer.record_interruption(call_id);
    }

    pub fn is_speaking(&self, call_id: &CallId) -> bool {
        self.calls.get(call_id).map(|s| s.speaking).unwrap_or(false)
    }

    pub fn call_status(&self, call_id: &CallId) -> Option<CallVadStatus> {
        self.calls.get(call_id).map(|s| CallVadStatus {
            frames: s.frames,
            speech_frames: s.speech_frames,
            silence_frames: s.silence_frames,
            speaking: s.speaking,
            threshold: s.threshold(&self.config),
            base_threshold: s
                .adaptive
                .as_ref()
                .map(|a| a.base())
                .unwrap_or(self.config.energy_threshold),
            environment: s.environment,
        })
    }

    /// Current context analysis of a call
    pub fn call_context(&self, call_id: &CallId) -> Option<CallContext> {
        let snapshot = self.calls.get(call_id)?.snapshot();
        Some(self.analyzer.analyze(call_id, snapshot))
    }

    /// Discard every piece of VAD and context state held for a call
    pub fn reset_call(&self, call_id: &CallId) {
        self.calls.remove(call_id);
        self.analyzer.reset_call(call_id);
        debug!(call_id = %call_id, "VAD state reset");
    }

    pub fn tracked_calls(&self) -> usize {
        self.calls.len()
    }
}

/// Combine energy and the optional classifier into (speech-like, confidence)
fn combine(energy: f32, threshold: f32, classifier: Option<bool>) -> (bool, f32) {
    let energy_speech = threshold > 0.0 && energy >= threshold;
    let energy_share = if energy_speech {
        0.4 * (energy / threshold / 2.0).min(1.0)
    } else {
        0.0
    };

    match classifier {
        Some(classifier_speech) => {
            let classifier_share = if classifier_speech { 0.4 } else { 0.0 };
            let agreement = if classifier_speech && energy_speech { 0.2 } else { 0.0 };
            let confidence = (classifier_share + energy_share + agreement).min(1.0);
            (confidence >= SPEECH_CONFIDENCE, confidence)
        }
        None => {
            let confidence = if energy_speech { (energy_share + 0.2).min(1.0) } else { 0.0 };
            (energy_speech, confidence)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_weights() {
        // both agree, loud: 0.4 + 0.4 + 0.2
        let (speech, confidence) = combine(0.1, 0.02, Some(true));
        assert!(speech);
        assert!((confidence - 1.0).abs() < 1e-6);

        // energy at threshold only, classifier disagrees
        let (speech, confidence) = combine(0.02, 0.02, Some(false));
        assert!(!speech);
        assert!((confidence - 0.2).abs() < 1e-6);

        // classifier alone is not enough
        let (speech, confidence) = combine(0.001, 0.02, Some(true));
        assert!(!speech);
        assert!((confidence - 0.4).abs() < 1e-6);

        // energy-only path
        let (speech, confidence) = combine(0.04, 0.02, None);
        assert!(speech);
        assert!((confidence - 0.6).abs() < 1e-6);
        assert_eq!(combine(0.01, 0.02, None), (false, 0.0));
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut config = VadConfig::default();
        config.min_speech_frames = 0;
        assert!(config.validate().is_err());

        let mut config = VadConfig::default();
        config.adaptive_window = 5;
        config.adaptive_min_samples = 10;
        assert!(config.validate().is_err());

        let mut config = VadConfig::default();
        config.threshold_blend = 0.0;
        assert!(config.validate().is_err());

        let mut config = VadConfig::default();
        config.energy_threshold = 1.5;
        assert!(VadManager::new(config).is_err());
    }

    #[test]
    fn test_unsupported_rate_skips_classifier() {
        let vad = VadManager::new(VadConfig::default()).unwrap();
        let call = CallId::from("c1");
        let frame = vec![4000i16; 220];
        assert!(!vad.process_frame(&call, &frame, 11025).classifier_used);
        assert!(vad.process_frame(&call, &frame, 8000).classifier_used);
    }
}
