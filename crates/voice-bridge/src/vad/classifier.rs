//! Secondary speech classifiers
//!
//! A classifier gives a binary speech decision for a frame. The VAD runs it
//! only for whitelisted sample rates and falls back to energy alone otherwise.

use std::fmt::Debug;

use crate::audio::{rms_energy, zero_crossing_rate};

/// Binary per-frame speech classifier
pub trait SpeechClassifier: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn is_speech(&self, samples: &[i16], sample_rate: u32) -> bool;
}

/// Classifier based on zero crossing rate
///
/// Voiced speech sits in a moderate ZCR band; tonal hum crosses too rarely and
/// broadband hiss too often.
#[derive(Debug, Clone)]
pub struct ZeroCrossingClassifier {
    pub min_zcr: f32,
    pub max_zcr: f32,
    /// Frames quieter than this are never speech
    pub min_energy: f32,
}

impl Default for ZeroCrossingClassifier {
    fn default() -> Self {
        Self {
            min_zcr: 0.02,
            max_zcr: 0.35,
            min_energy: 0.002,
        }
    }
}

impl SpeechClassifier for ZeroCrossingClassifier {
    fn name(&self) -> &'static str {
        "zero-crossing"
    }

    fn is_speech(&self, samples: &[i16], _sample_rate: u32) -> bool {
        if rms_energy(samples) < self.min_energy {
            return false;
        }
        let zcr = zero_crossing_rate(samples);
        zcr > self.min_zcr && zcr < self.max_zcr
    }
}
