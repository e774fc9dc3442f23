//! Source distance heuristic from loudness and SNR.
//! Quiet, low-SNR sound is assumed to come from farther away and to have lost
//! its high frequencies on the way; no spectral analysis is done.

use tracing::trace;

/// Floor applied to the background estimate before dividing by it.
pub const MIN_BACKGROUND_NOISE: f32 = 0.001;
pub const MIN_DISTANCE_M: f32 = 0.3;
pub const MAX_DISTANCE_M: f32 = 5.0;

/// (snr_db strictly above, distance in meters), checked in order.
const SNR_DISTANCE_TIERS: [(f32, f32); 6] = [
    (30.0, 0.3),
    (20.0, 0.7),
    (15.0, 1.2),
    (10.0, 2.0),
    (6.0, 3.0),
    (3.0, 4.0),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceEstimate {
    pub distance_m: f32,
    pub snr: f32,
    pub snr_db: f32,
    pub rms_db: f32,
    pub frequency_factor: f32,
}

/// Decibels of an amplitude ratio.
#[inline]
pub fn amplitude_db(value: f32) -> f32 {
    20.0 * value.log10()
}

pub fn estimate_distance(rms: f32, background_noise: f32) -> DistanceEstimate {
    let background_noise = background_noise.max(MIN_BACKGROUND_NOISE);
    let snr = rms / background_noise;
    let snr_db = amplitude_db(snr);
    let rms_db = amplitude_db(rms.max(0.0001));
    let frequency_factor = frequency_attenuation(snr);

    let distance_m = (base_distance(snr_db) * rms_correction(rms_db) * frequency_factor)
        .clamp(MIN_DISTANCE_M, MAX_DISTANCE_M);

    trace!(snr_db, rms_db, distance_m, "distance_estimated");

    DistanceEstimate {
        distance_m,
        snr,
        snr_db,
        rms_db,
        frequency_factor,
    }
}

/// Distance multiplier for the assumed loss of high frequencies.
pub fn frequency_attenuation(snr: f32) -> f32 {
    if snr < 2.0 {
        1.3
    } else if snr < 5.0 {
        1.1
    } else {
        1.0
    }
}

fn base_distance(snr_db: f32) -> f32 {
    SNR_DISTANCE_TIERS
        .iter()
        .find(|(above, _)| snr_db > *above)
        .map(|(_, d)| *d)
        .unwrap_or(MAX_DISTANCE_M)
}

fn rms_correction(rms_db: f32) -> f32 {
    // The -10 dB tier is shadowed by the -15 dB one; kept to preserve tuning.
    if rms_db < -40.0 {
        1.5
    } else if rms_db < -30.0 {
        1.2
    } else if rms_db > -15.0 {
        0.8
    } else if rms_db > -10.0 {
        0.6
    } else {
        1.0
    }
}
