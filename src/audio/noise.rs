//! Adaptive noise floor: median of recent non-voice RMS values, and the voice
//! threshold derived from it.

use std::collections::VecDeque;

use crate::config::VadConfig;

pub struct NoiseEstimator {
    history: VecDeque<f32>,
    capacity: usize,
    min_samples: usize,
    multiplier: f32,
    static_threshold: f32,
    default_background: f32,
    background_noise: f32,
    adaptive_threshold: f32,
}

impl NoiseEstimator {
    pub fn new(cfg: &VadConfig) -> Self {
        let capacity = cfg.noise_history_capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            min_samples: cfg.min_noise_samples.max(1),
            multiplier: cfg.noise_multiplier,
            static_threshold: cfg.static_voice_threshold,
            default_background: cfg.default_background_noise,
            background_noise: cfg.default_background_noise,
            adaptive_threshold: cfg.static_voice_threshold,
        }
    }

    /// Feed one non-voice RMS value. Callers skip this while voice is active so
    /// the user's own voice never inflates the floor.
    /// Returns true when the background estimate was recomputed.
    pub fn observe(&mut self, rms: f32) -> bool {
        self.history.push_back(rms);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        if self.history.len() < self.min_samples {
            return false;
        }
        if let Some(median) = self.median() {
            self.background_noise = median;
            self.adaptive_threshold = self.threshold_for(median);
        }
        true
    }

    /// Middle element of the sorted history (upper middle for even sizes).
    pub fn median(&self) -> Option<f32> {
        if self.history.is_empty() {
            return None;
        }
        let mut sorted: Vec<f32> = self.history.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(sorted[sorted.len() / 2])
    }

    /// max(static threshold, background * multiplier)
    #[inline]
    pub fn threshold_for(&self, background_noise: f32) -> f32 {
        self.static_threshold.max(background_noise * self.multiplier)
    }

    pub fn background_noise(&self) -> f32 {
        self.background_noise
    }

    pub fn adaptive_threshold(&self) -> f32 {
        self.adaptive_threshold
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Replace the current threshold until the next noise update.
    pub fn override_threshold(&mut self, threshold: f32) {
        self.adaptive_threshold = threshold;
    }

    /// Forget the history and fall back to the default background.
    pub fn clear(&mut self) {
        self.history.clear();
        self.background_noise = self.default_background;
        self.adaptive_threshold = self.static_threshold;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> NoiseEstimator {
        NoiseEstimator::new(&VadConfig::default())
    }

    #[test]
    fn defaults_before_enough_samples() {
        let mut n = estimator();
        for _ in 0..9 {
            assert!(!n.observe(0.05));
        }
        assert_eq!(n.background_noise(), 0.005);
        assert_eq!(n.adaptive_threshold(), 0.10);
    }

    #[test]
    fn background_is_exact_median_of_window() {
        let mut n = estimator();
        let seq = [0.011, 0.002, 0.009, 0.004, 0.020, 0.001, 0.015, 0.007, 0.003, 0.006, 0.012];
        for v in seq {
            n.observe(v);
        }
        // sorted: .001 .002 .003 .004 .006 .007 .009 .011 .012 .015 .020
        assert_eq!(n.len(), 11);
        assert_eq!(n.background_noise(), 0.007);
    }

    #[test]
    fn history_is_bounded_and_evicts_oldest() {
        let mut n = estimator();
        for _ in 0..50 {
            n.observe(0.5);
        }
        for _ in 0..50 {
            n.observe(0.01);
        }
        assert_eq!(n.len(), 50);
        assert_eq!(n.background_noise(), 0.01);
    }

    #[test]
    fn threshold_never_below_static_floor() {
        let n = estimator();
        for bg in [0.0, 0.001, 0.01, 0.0166, 0.05, 0.2, 1.0] {
            assert!(n.threshold_for(bg) >= 0.10);
        }
        assert_eq!(n.threshold_for(0.01), 0.10);
        assert!((n.threshold_for(0.05) - 0.30).abs() < 1e-6);
    }

    #[test]
    fn loud_room_raises_threshold() {
        let mut n = estimator();
        for _ in 0..10 {
            n.observe(0.04);
        }
        assert!((n.adaptive_threshold() - 0.24).abs() < 1e-6);
    }

    #[test]
    fn clear_restores_defaults() {
        let mut n = estimator();
        for _ in 0..20 {
            n.observe(0.04);
        }
        n.clear();
        assert!(n.is_empty());
        assert_eq!(n.median(), None);
        assert_eq!(n.background_noise(), 0.005);
        assert_eq!(n.adaptive_threshold(), 0.10);
    }

    #[test]
    fn override_lasts_until_next_noise_update() {
        let mut n = estimator();
        n.override_threshold(0.05);
        assert_eq!(n.adaptive_threshold(), 0.05);
        for _ in 0..9 {
            n.observe(0.01);
        }
        assert_eq!(n.adaptive_threshold(), 0.05);
        // Tenth sample: median 0.01 * 6 = 0.06, the static 0.10 wins.
        n.observe(0.01);
        assert_eq!(n.adaptive_threshold(), 0.10);
    }

    #[test]
    fn clear_drops_override() {
        let mut n = estimator();
        n.override_threshold(0.5);
        n.clear();
        assert_eq!(n.adaptive_threshold(), 0.10);
    }
}
