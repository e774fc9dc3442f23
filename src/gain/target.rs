//! Target microphone level from estimated distance, SNR and noise floor.

use tracing::trace;

use super::distance::{amplitude_db, MAX_DISTANCE_M, MIN_BACKGROUND_NOISE};
use crate::config::GainConfig;

/// Level reduction at the maximum distance, in percentage points.
const MAX_DISTANCE_REDUCTION: f32 = 80.0;

/// Target level for a frame with the given `rms` over `background_noise`.
pub fn target_gain(distance: f32, rms: f32, background_noise: f32, cfg: &GainConfig) -> f32 {
    let background_noise = background_noise.max(MIN_BACKGROUND_NOISE);
    let snr_db = amplitude_db((rms / background_noise).max(0.001));
    target_gain_for_snr(distance, snr_db, background_noise, cfg)
}

/// Same as [`target_gain`] with the SNR already in decibels.
pub fn target_gain_for_snr(distance: f32, snr_db: f32, background_noise: f32, cfg: &GainConfig) -> f32 {
    let distance_factor = (distance / MAX_DISTANCE_M).min(1.0);
    let base_reduction = distance_factor * MAX_DISTANCE_REDUCTION;

    let snr_adjustment = if snr_db < 3.0 {
        -20.0
    } else if snr_db < 6.0 {
        -10.0
    } else if snr_db > 20.0 {
        10.0
    } else {
        0.0
    };

    let noise_db = amplitude_db(background_noise.max(0.0001));
    let noise_adjustment = if noise_db > -20.0 {
        -15.0
    } else if noise_db < -40.0 {
        5.0
    } else {
        0.0
    };

    let mut target = cfg.normal_level - base_reduction + snr_adjustment + noise_adjustment;

    if distance > 4.0 && snr_db < 6.0 {
        target = cfg.background_level;
    } else if distance < 0.5 && snr_db > 15.0 {
        target = cfg.normal_level;
    }

    let target = cfg.clamp_level(target);
    trace!(distance, snr_db, noise_db, target, "gain_target_computed");
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GainConfig {
        GainConfig::default()
    }

    #[test]
    fn close_and_clear_forces_normal() {
        assert_eq!(target_gain_for_snr(0.3, 25.0, 0.005, &cfg()), 100.0);
        assert_eq!(target_gain_for_snr(0.3, 25.0, 0.2, &cfg()), 100.0);
    }

    #[test]
    fn far_and_noisy_forces_background() {
        assert_eq!(target_gain_for_snr(4.5, 4.0, 0.005, &cfg()), 20.0);
    }

    #[test]
    fn quiet_room_mid_distance() {
        // 100 - 32 + 0 + 5
        let t = target_gain_for_snr(2.0, 10.0, 0.005, &cfg());
        assert!((t - 73.0).abs() < 1e-4);
    }

    #[test]
    fn loud_room_mid_distance() {
        // 100 - 32 + 0 - 15
        let t = target_gain_for_snr(2.0, 10.0, 0.2, &cfg());
        assert!((t - 53.0).abs() < 1e-4);
    }

    #[test]
    fn neutral_noise_band_has_no_adjustment() {
        // noise 0.03 → ~-30 dB; 100 - 48 - 10 + 0
        let t = target_gain_for_snr(3.0, 5.0, 0.03, &cfg());
        assert!((t - 42.0).abs() < 1e-4);
    }

    #[test]
    fn result_is_always_clamped() {
        for d in [0.3, 1.0, 2.5, 4.0, 5.0] {
            for snr in [-20.0, 0.0, 4.0, 10.0, 18.0, 40.0] {
                for bg in [0.001, 0.01, 0.5] {
                    let t = target_gain_for_snr(d, snr, bg, &cfg());
                    assert!((20.0..=100.0).contains(&t));
                }
            }
        }
    }

    #[test]
    fn rms_entry_point_matches_snr_entry_point() {
        let a = target_gain(1.2, 0.05, 0.01, &cfg());
        let b = target_gain_for_snr(1.2, amplitude_db(5.0), 0.01, &cfg());
        assert!((a - b).abs() < 1e-3);
    }

    #[test]
    fn silent_frame_has_finite_target() {
        let t = target_gain(5.0, 0.0, 0.0, &cfg());
        assert_eq!(t, 20.0);
    }
}
