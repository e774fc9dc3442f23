//! Engine configuration: every tuning constant of the detector, the gain
//! controller and the capture pipeline in one immutable value.
//! Defaults reproduce the shipped behavior exactly. A JSON file may override
//! any subset of keys; missing keys keep their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Voice activity detection and noise-floor tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Frames below this RMS are silence outright.
    pub silence_floor: f32,
    /// Lower bound for the adaptive threshold.
    pub static_voice_threshold: f32,
    /// adaptive threshold = max(static, background * multiplier)
    pub noise_multiplier: f32,
    pub noise_history_capacity: usize,
    /// Samples needed before the median replaces the default background.
    pub min_noise_samples: usize,
    pub default_background_noise: f32,
    /// A frame louder than previous * ratio counts as high.
    pub spike_ratio: f32,
    pub consecutive_frames_needed: u32,
    pub analysis_window: usize,
    /// The rolling average is only consulted once the window has this many values.
    pub min_window_for_smoothing: usize,
    pub smoothing_ratio: f32,
    pub silence_timeout_ms: u64,
    pub min_voice_duration_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_floor: 0.03,
            static_voice_threshold: 0.10,
            noise_multiplier: 6.0,
            noise_history_capacity: 50,
            min_noise_samples: 10,
            default_background_noise: 0.005,
            spike_ratio: 2.5,
            consecutive_frames_needed: 5,
            analysis_window: 10,
            min_window_for_smoothing: 3,
            smoothing_ratio: 0.85,
            silence_timeout_ms: 500,
            min_voice_duration_ms: 400,
        }
    }
}

impl VadConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn min_voice_duration(&self) -> Duration {
        Duration::from_millis(self.min_voice_duration_ms)
    }
}

/// Gain target and smoothing loop tuning. Levels are percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainConfig {
    pub normal_level: f32,
    pub background_level: f32,
    pub tick_interval_ms: u64,
    /// Fraction of the remaining distance covered per tick.
    pub smoothness: f32,
    /// Ticks with |target - current| at or below this do nothing.
    pub convergence_epsilon: f32,
    /// A recomputed target only replaces the current one past this delta.
    pub retarget_hysteresis: f32,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            normal_level: 100.0,
            background_level: 20.0,
            tick_interval_ms: 200,
            smoothness: 0.3,
            convergence_epsilon: 1.0,
            retarget_hysteresis: 5.0,
        }
    }
}

impl GainConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Clamp a level into [background, normal].
    #[inline]
    pub fn clamp_level(&self, level: f32) -> f32 {
        level.clamp(self.background_level, self.normal_level)
    }
}

/// Capture pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u32,
    pub ring_buffer_secs: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_ms: 20,
            ring_buffer_secs: 1.0,
        }
    }
}

impl CaptureConfig {
    /// Samples per analysis frame (320 at 16 kHz / 20 ms).
    pub fn frame_size(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub vad: VadConfig,
    pub gain: GainConfig,
    pub capture: CaptureConfig,
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(content: &str) -> Result<Self, EngineError> {
        let cfg: Self = serde_json::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.vad.validate()?;
        self.gain.validate()?;
        self.capture.validate()
    }
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidConfig(msg.into())
}

fn check_unit(name: &str, value: f32) -> Result<(), EngineError> {
    if !(value.is_finite() && value > 0.0 && value <= 1.0) {
        return Err(invalid(format!("{name} must be in (0, 1], got {value}")));
    }
    Ok(())
}

impl VadConfig {
    fn validate(&self) -> Result<(), EngineError> {
        check_unit("vad.silence_floor", self.silence_floor)?;
        check_unit("vad.static_voice_threshold", self.static_voice_threshold)?;
        check_unit("vad.default_background_noise", self.default_background_noise)?;
        check_unit("vad.smoothing_ratio", self.smoothing_ratio)?;
        if !(self.noise_multiplier.is_finite() && self.noise_multiplier > 0.0) {
            return Err(invalid("vad.noise_multiplier must be positive"));
        }
        if !(self.spike_ratio.is_finite() && self.spike_ratio > 1.0) {
            return Err(invalid("vad.spike_ratio must be greater than 1"));
        }
        if self.consecutive_frames_needed == 0 {
            return Err(invalid("vad.consecutive_frames_needed must be at least 1"));
        }
        if self.analysis_window == 0 {
            return Err(invalid("vad.analysis_window must be at least 1"));
        }
        if self.min_noise_samples == 0 || self.min_noise_samples > self.noise_history_capacity {
            return Err(invalid(format!(
                "vad.min_noise_samples must be in 1..={}, got {}",
                self.noise_history_capacity, self.min_noise_samples
            )));
        }
        Ok(())
    }
}

impl GainConfig {
    fn validate(&self) -> Result<(), EngineError> {
        let levels_ok = self.background_level.is_finite()
            && self.normal_level.is_finite()
            && 0.0 <= self.background_level
            && self.background_level <= self.normal_level
            && self.normal_level <= 100.0;
        if !levels_ok {
            return Err(invalid(format!(
                "gain levels need 0 <= background ({}) <= normal ({}) <= 100",
                self.background_level, self.normal_level
            )));
        }
        check_unit("gain.smoothness", self.smoothness)?;
        if self.tick_interval_ms == 0 {
            return Err(invalid("gain.tick_interval_ms must be positive"));
        }
        for (name, value) in [
            ("gain.convergence_epsilon", self.convergence_epsilon),
            ("gain.retarget_hysteresis", self.retarget_hysteresis),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(invalid(format!("{name} must be non-negative, got {value}")));
            }
        }
        Ok(())
    }
}

impl CaptureConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(invalid("capture.sample_rate and capture.channels must be positive"));
        }
        if self.frame_size() == 0 {
            return Err(invalid("capture.frame_ms yields an empty frame"));
        }
        if !(self.ring_buffer_secs.is_finite() && self.ring_buffer_secs > 0.0) {
            return Err(invalid("capture.ring_buffer_secs must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.vad.silence_floor, 0.03);
        assert_eq!(cfg.vad.static_voice_threshold, 0.10);
        assert_eq!(cfg.vad.noise_history_capacity, 50);
        assert_eq!(cfg.vad.consecutive_frames_needed, 5);
        assert_eq!(cfg.vad.silence_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.vad.min_voice_duration(), Duration::from_millis(400));
        assert_eq!(cfg.gain.tick_interval(), Duration::from_millis(200));
        assert_eq!(cfg.capture.frame_size(), 320);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let cfg = EngineConfig::from_json(r#"{ "vad": { "spike_ratio": 3.0 }, "gain": { "smoothness": 0.5 } }"#)
            .unwrap();
        assert_eq!(cfg.vad.spike_ratio, 3.0);
        assert_eq!(cfg.vad.silence_floor, 0.03);
        assert_eq!(cfg.gain.smoothness, 0.5);
        assert_eq!(cfg.gain.normal_level, 100.0);
        assert_eq!(cfg.capture, CaptureConfig::default());
    }

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_gain_levels_are_rejected() {
        let err = EngineConfig::from_json(r#"{ "gain": { "background_level": 120.0 } }"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for json in [
            r#"{ "gain": { "smoothness": 0.0 } }"#,
            r#"{ "gain": { "smoothness": 1.5 } }"#,
            r#"{ "gain": { "tick_interval_ms": 0 } }"#,
            r#"{ "gain": { "retarget_hysteresis": -1.0 } }"#,
            r#"{ "vad": { "consecutive_frames_needed": 0 } }"#,
            r#"{ "vad": { "min_noise_samples": 60 } }"#,
            r#"{ "vad": { "silence_floor": 0.0 } }"#,
            r#"{ "capture": { "frame_ms": 0 } }"#,
        ] {
            let err = EngineConfig::from_json(json).unwrap_err();
            assert!(matches!(err, EngineError::InvalidConfig(_)), "{json}");
        }
    }

    #[test]
    fn smoothness_of_one_is_allowed() {
        let cfg = EngineConfig::from_json(r#"{ "gain": { "smoothness": 1.0 } }"#).unwrap();
        assert_eq!(cfg.gain.smoothness, 1.0);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = EngineConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, EngineError::ConfigParse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = EngineConfig::load_from_file(Path::new("/nonexistent/smartmic.json")).unwrap_err();
        assert!(matches!(err, EngineError::ConfigIo(_)));
    }

    #[test]
    fn clamp_level_bounds() {
        let gain = GainConfig::default();
        assert_eq!(gain.clamp_level(150.0), 100.0);
        assert_eq!(gain.clamp_level(-3.0), 20.0);
        assert_eq!(gain.clamp_level(55.5), 55.5);
    }
}
