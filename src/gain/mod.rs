//! Adaptive microphone gain: target selection from voice activity and the
//! smoothing loop that walks the applied level toward it.
//!
//! While the user speaks the target is pinned to the normal level. Otherwise
//! every analyzed frame proposes a target from the estimated source distance;
//! small proposals are ignored so the target does not jitter. Each control
//! tick then covers a fixed fraction of the remaining gap.

pub mod distance;
pub mod target;

use tracing::{debug, info, warn};

use crate::config::GainConfig;
use crate::error::EngineError;

/// External volume control. Called off the engine's critical section.
pub trait GainSink: Send + Sync {
    fn set_microphone_volume(&self, percentage: u8) -> Result<(), EngineError>;
}

/// Sink that only logs; used when no OS volume control is wired in.
pub struct LoggingGainSink;

impl GainSink for LoggingGainSink {
    fn set_microphone_volume(&self, percentage: u8) -> Result<(), EngineError> {
        info!(percentage, "microphone_volume_set");
        Ok(())
    }
}

/// Round a level to the integer percentage handed to the sink.
#[inline]
pub fn to_percentage(level: f32) -> u8 {
    level.round().clamp(0.0, 100.0) as u8
}

/// Result of a tick that moved the level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainAdjustment {
    pub current_level: f32,
    pub target_level: f32,
    pub is_user_speaking: bool,
}

impl GainAdjustment {
    pub fn percentage(&self) -> u8 {
        to_percentage(self.current_level)
    }
}

/// Gain bookkeeping. Both levels stay within [background, normal].
pub struct GainController {
    cfg: GainConfig,
    current: f32,
    target: f32,
    is_user_speaking: bool,
}

impl GainController {
    pub fn new(cfg: GainConfig) -> Self {
        let normal = cfg.normal_level;
        Self {
            cfg,
            current: normal,
            target: normal,
            is_user_speaking: false,
        }
    }

    /// Back to the unmodified microphone.
    pub fn reset(&mut self) {
        self.current = self.cfg.normal_level;
        self.target = self.cfg.normal_level;
        self.is_user_speaking = false;
    }

    pub fn on_voice_started(&mut self) {
        self.is_user_speaking = true;
        self.target = self.cfg.normal_level;
        debug!(target = self.target, "user speaking, gain pinned to normal");
    }

    pub fn on_voice_stopped(&mut self) {
        self.is_user_speaking = false;
        debug!("user stopped speaking");
    }

    /// Propose a new target from a frame's loudness. Returns the new target
    /// when it replaced the previous one.
    pub fn on_voice_changed(&mut self, rms: f32, background_noise: f32) -> Option<f32> {
        if self.is_user_speaking {
            self.target = self.cfg.normal_level;
            return None;
        }

        let estimate = distance::estimate_distance(rms, background_noise);
        let proposed = target::target_gain(estimate.distance_m, rms, background_noise, &self.cfg);

        if (proposed - self.target).abs() > self.cfg.retarget_hysteresis {
            self.set_target(proposed);
            debug!(
                distance_m = estimate.distance_m,
                rms,
                target = self.target,
                "gain_target_changed"
            );
            return Some(self.target);
        }
        None
    }

    pub fn set_target(&mut self, level: f32) {
        self.target = self.cfg.clamp_level(level);
    }

    /// One smoothing step. Returns `None` once within the convergence epsilon.
    pub fn tick(&mut self) -> Option<GainAdjustment> {
        let diff = self.target - self.current;
        if diff.abs() <= self.cfg.convergence_epsilon {
            return None;
        }
        self.current = self.cfg.clamp_level(self.current + diff * self.cfg.smoothness);
        Some(GainAdjustment {
            current_level: self.current,
            target_level: self.target,
            is_user_speaking: self.is_user_speaking,
        })
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn is_user_speaking(&self) -> bool {
        self.is_user_speaking
    }

    pub fn normal_level(&self) -> f32 {
        self.cfg.normal_level
    }
}

/// Apply a level through the sink. Failures are logged and swallowed: the
/// controller keeps its bookkeeping and converges again on the next tick.
pub fn apply_level(sink: &dyn GainSink, level: f32) -> bool {
    let percentage = to_percentage(level);
    match sink.set_microphone_volume(percentage) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, percentage, "failed to apply microphone level");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> GainController {
        GainController::new(GainConfig::default())
    }

    #[test]
    fn starts_converged_at_normal() {
        let mut g = controller();
        assert_eq!(g.current(), 100.0);
        assert_eq!(g.target(), 100.0);
        assert!(g.tick().is_none());
    }

    #[test]
    fn gap_shrinks_geometrically() {
        let mut g = controller();
        g.set_target(20.0);
        let initial = g.target() - g.current();
        for k in 1..=5 {
            let adj = g.tick().expect("still converging");
            let expected = initial.abs() * 0.7f32.powi(k);
            assert!(((adj.target_level - adj.current_level).abs() - expected).abs() < 1e-3);
        }
    }

    #[test]
    fn convergence_bounded_for_any_start_up_to_80() {
        // 80 * 0.7^13 < 1, so no start within range needs more than 13 moves.
        for initial in [1.5f32, 10.0, 33.3, 55.0, 80.0] {
            let mut g = controller();
            g.set_target(100.0 - initial);
            let bound = (initial.ln() / (1.0f32 / 0.7).ln()).ceil() as usize;
            let mut moves = 0;
            while g.tick().is_some() {
                moves += 1;
                assert!(moves <= 13, "initial {initial} did not converge");
            }
            assert!(moves <= bound, "initial {initial}: {moves} > {bound}");
            assert!((g.target() - g.current()).abs() <= 1.0);
        }
    }

    #[test]
    fn levels_are_clamped() {
        let mut g = controller();
        g.set_target(-40.0);
        assert_eq!(g.target(), 20.0);
        g.set_target(400.0);
        assert_eq!(g.target(), 100.0);
        while let Some(adj) = g.tick() {
            assert!((20.0..=100.0).contains(&adj.current_level));
        }
    }

    #[test]
    fn speaking_pins_target_to_normal() {
        let mut g = controller();
        g.set_target(20.0);
        g.on_voice_started();
        assert_eq!(g.target(), 100.0);
        // Far, faint frames would otherwise pull the target down.
        assert!(g.on_voice_changed(0.005, 0.01).is_none());
        assert_eq!(g.target(), 100.0);
        g.on_voice_stopped();
        assert_eq!(g.on_voice_changed(0.005, 0.01), Some(20.0));
    }

    #[test]
    fn small_retarget_is_ignored() {
        let mut g = controller();
        // snr 8 (18 dB) → 1.2 m in a quiet room → 100 - 19.2 + 5 = 85.8
        g.set_target(83.0);
        assert!(g.on_voice_changed(0.04, 0.005).is_none());
        assert_eq!(g.target(), 83.0);

        g.set_target(75.0);
        let retargeted = g.on_voice_changed(0.04, 0.005).expect("past hysteresis");
        assert!((retargeted - 85.8).abs() < 1e-3);
    }

    #[test]
    fn percentage_rounding() {
        assert_eq!(to_percentage(76.4), 76);
        assert_eq!(to_percentage(76.5), 77);
        assert_eq!(to_percentage(120.0), 100);
    }

    struct FailingSink;

    impl GainSink for FailingSink {
        fn set_microphone_volume(&self, _percentage: u8) -> Result<(), EngineError> {
            Err(EngineError::GainSink("device busy".into()))
        }
    }

    #[test]
    fn sink_failure_is_reported_not_raised() {
        assert!(!apply_level(&FailingSink, 50.0));
        assert!(apply_level(&LoggingGainSink, 50.0));
    }
}
