//! Rolling noise-floor estimation for the energy threshold

use std::collections::VecDeque;

/// Per-call adaptive energy threshold
///
/// Energy from non-speech frames is kept in a bounded window. Once enough
/// samples exist the live threshold is blended toward
/// `max(base, noise_floor * multiplier)` instead of jumping to it.
#[derive(Debug, Clone)]
pub struct AdaptiveThreshold {
    base: f32,
    current: f32,
    samples: VecDeque<f32>,
    window: usize,
    min_samples: usize,
    multiplier: f32,
    blend: f32,
}

impl AdaptiveThreshold {
    pub fn new(base: f32, window: usize, min_samples: usize, multiplier: f32, blend: f32) -> Self {
        Self {
            base,
            current: base,
            samples: VecDeque::with_capacity(window),
            window: window.max(1),
            min_samples: min_samples.max(1),
            multiplier,
            blend: blend.clamp(0.0, 1.0),
        }
    }

    /// Feed the energy of a non-speech frame; returns the updated threshold
    pub fn observe_noise(&mut self, energy: f32) -> f32 {
        if self.samples.len() >= self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(energy.max(0.0));

        if let Some(target) = self.target() {
            self.current += self.blend * (target - self.current);
        }
        self.current
    }

    /// Median of the noise window, once `min_samples` have been seen
    pub fn noise_floor(&self) -> Option<f32> {
        if self.samples.len() < self.min_samples {
            return None;
        }
        let mut sorted: Vec<f32> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Some(median)
    }

    /// Threshold the live value is moving toward
    pub fn target(&self) -> Option<f32> {
        self.noise_floor()
            .map(|floor| self.base.max(floor * self.multiplier))
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn base(&self) -> f32 {
        self.base
    }

    /// Move the base; the live threshold follows on the next noise sample
    pub fn set_base(&mut self, base: f32) {
        self.base = base;
        if self.samples.len() < self.min_samples {
            self.current = base;
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
