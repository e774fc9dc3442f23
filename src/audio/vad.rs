//! Voice Activity Detection: RMS energy → noise-adaptive threshold →
//! debounced Silence/Voice state machine.
//!
//! A frame is a "high" candidate when it is a sudden spike over the previous
//! frame, exceeds the adaptive threshold, or the short rolling average sits
//! close to the threshold. Only a run of consecutive high frames confirms
//! voice. Leaving Voice needs both a silence timeout and a minimum voice
//! duration, so an episode shorter than the minimum stays Voice until a
//! longer one follows.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::noise::NoiseEstimator;
use crate::config::VadConfig;

/// RMS energy of normalized samples. Samples are clamped to [-1, 1], so the
/// result is in [0, 1]; an empty frame is 0.
#[inline]
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let f = s.clamp(-1.0, 1.0) as f64;
            f * f
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceTransition {
    Started,
    Stopped,
}

/// Outcome of one analyzed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameDecision {
    pub rms: f32,
    pub threshold: f32,
    pub background_noise: f32,
    /// Debounced per-frame decision.
    pub is_voice_frame: bool,
    pub transition: Option<VoiceTransition>,
}

pub struct VoiceActivityDetector {
    silence_floor: f32,
    spike_ratio: f32,
    consecutive_frames_needed: u32,
    window_size: usize,
    min_window_for_smoothing: usize,
    smoothing_ratio: f32,
    silence_timeout: Duration,
    min_voice_duration: Duration,

    recent: VecDeque<f32>,
    previous_rms: f32,
    consecutive_high_frames: u32,
    is_voice: bool,
    /// `None` is the epoch: no voice seen since the last reset.
    voice_start_time: Option<Instant>,
    last_voice_time: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(cfg: &VadConfig) -> Self {
        let window_size = cfg.analysis_window.max(1);
        Self {
            silence_floor: cfg.silence_floor,
            spike_ratio: cfg.spike_ratio,
            consecutive_frames_needed: cfg.consecutive_frames_needed.max(1),
            window_size,
            min_window_for_smoothing: cfg.min_window_for_smoothing,
            smoothing_ratio: cfg.smoothing_ratio,
            silence_timeout: cfg.silence_timeout(),
            min_voice_duration: cfg.min_voice_duration(),
            recent: VecDeque::with_capacity(window_size + 1),
            previous_rms: 0.0,
            consecutive_high_frames: 0,
            is_voice: false,
            voice_start_time: None,
            last_voice_time: None,
        }
    }

    /// Analyze one frame's RMS at `now`. Updates the noise floor first (only
    /// outside Voice), then decides and applies any state transition.
    pub fn process(&mut self, rms: f32, noise: &mut NoiseEstimator, now: Instant) -> FrameDecision {
        if !self.is_voice {
            noise.observe(rms);
        }
        let threshold = noise.adaptive_threshold();

        self.recent.push_back(rms);
        while self.recent.len() > self.window_size {
            self.recent.pop_front();
        }

        let is_voice_frame = self.decide(rms, threshold);
        let transition = self.apply(is_voice_frame, rms, threshold, now);
        self.previous_rms = rms;

        FrameDecision {
            rms,
            threshold,
            background_noise: noise.background_noise(),
            is_voice_frame,
            transition,
        }
    }

    fn decide(&mut self, rms: f32, threshold: f32) -> bool {
        if rms < self.silence_floor {
            self.consecutive_high_frames = 0;
            return false;
        }

        let is_spike = self.previous_rms > 0.0 && rms > self.previous_rms * self.spike_ratio;
        if is_spike {
            trace!(rms, previous = self.previous_rms, "spike_frame");
        }

        let high = is_spike
            || rms > threshold
            || (self.recent.len() >= self.min_window_for_smoothing
                && self.window_average() > threshold * self.smoothing_ratio);

        if !high {
            self.consecutive_high_frames = 0;
            return false;
        }
        self.consecutive_high_frames += 1;
        self.consecutive_high_frames >= self.consecutive_frames_needed
    }

    fn window_average(&self) -> f32 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().sum::<f32>() / self.recent.len() as f32
    }

    fn apply(
        &mut self,
        is_voice_frame: bool,
        rms: f32,
        threshold: f32,
        now: Instant,
    ) -> Option<VoiceTransition> {
        match (is_voice_frame, self.is_voice) {
            (true, false) => {
                self.is_voice = true;
                self.voice_start_time = Some(now);
                self.last_voice_time = Some(now);
                debug!(rms, threshold, "voice_started");
                Some(VoiceTransition::Started)
            }
            (true, true) => {
                self.last_voice_time = Some(now);
                None
            }
            (false, true) => {
                let (Some(start), Some(last)) = (self.voice_start_time, self.last_voice_time) else {
                    return None;
                };
                let silence = now.saturating_duration_since(last);
                let voice = last.saturating_duration_since(start);
                if silence > self.silence_timeout && voice > self.min_voice_duration {
                    self.is_voice = false;
                    debug!(voice_ms = voice.as_millis() as u64, "voice_stopped");
                    Some(VoiceTransition::Stopped)
                } else {
                    None
                }
            }
            (false, false) => None,
        }
    }

    /// State reset on resume: Silence, epoch timestamps, no debounce history.
    pub fn reset_voice_state(&mut self) {
        self.is_voice = false;
        self.voice_start_time = None;
        self.last_voice_time = None;
        self.consecutive_high_frames = 0;
        self.previous_rms = 0.0;
    }

    /// Full reset, including the rolling window.
    pub fn clear(&mut self) {
        self.reset_voice_state();
        self.recent.clear();
    }

    pub fn is_voice(&self) -> bool {
        self.is_voice
    }

    pub fn consecutive_high_frames(&self) -> u32 {
        self.consecutive_high_frames
    }

    pub fn previous_rms(&self) -> f32 {
        self.previous_rms
    }

    pub fn voice_start_time(&self) -> Option<Instant> {
        self.voice_start_time
    }

    pub fn last_voice_time(&self) -> Option<Instant> {
        self.last_voice_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(20);

    struct Harness {
        vad: VoiceActivityDetector,
        noise: NoiseEstimator,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let cfg = VadConfig::default();
            Self {
                vad: VoiceActivityDetector::new(&cfg),
                noise: NoiseEstimator::new(&cfg),
                now: Instant::now(),
            }
        }

        fn feed(&mut self, rms: f32) -> FrameDecision {
            let d = self.vad.process(rms, &mut self.noise, self.now);
            self.now += FRAME;
            d
        }

        fn feed_n(&mut self, rms: f32, n: usize) -> Vec<FrameDecision> {
            (0..n).map(|_| self.feed(rms)).collect()
        }
    }

    fn starts(ds: &[FrameDecision]) -> Vec<usize> {
        ds.iter()
            .enumerate()
            .filter(|(_, d)| d.transition == Some(VoiceTransition::Started))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn rms_of_known_signals() {
        assert_eq!(compute_rms(&[]), 0.0);
        assert!((compute_rms(&[0.5; 320]) - 0.5).abs() < 1e-6);
        let square: Vec<f32> = (0..320).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!((compute_rms(&square) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rms_stays_in_unit_range() {
        let hot = [4.0f32, -7.5, 1.0, -1.0];
        let rms = compute_rms(&hot);
        assert!((0.0..=1.0).contains(&rms));
    }

    #[test]
    fn fifth_loud_frame_starts_voice_exactly_once() {
        let mut h = Harness::new();
        let ds = h.feed_n(0.15, 8);
        assert_eq!(starts(&ds), vec![4]);
        assert!(ds[..4].iter().all(|d| !d.is_voice_frame));
        assert!(ds[4..].iter().all(|d| d.is_voice_frame));
        assert!(h.vad.is_voice());
    }

    #[test]
    fn quiet_frame_resets_debounce() {
        let mut h = Harness::new();
        h.feed_n(0.15, 4);
        assert_eq!(h.vad.consecutive_high_frames(), 4);
        h.feed(0.01);
        assert_eq!(h.vad.consecutive_high_frames(), 0);
        let ds = h.feed_n(0.15, 4);
        assert!(starts(&ds).is_empty());
    }

    #[test]
    fn short_episode_never_stops() {
        let mut h = Harness::new();
        // Onset on frame 5, last voice frame 100ms later.
        let ds = h.feed_n(0.15, 10);
        assert_eq!(starts(&ds), vec![4]);
        let start = h.vad.voice_start_time().unwrap();
        let last = h.vad.last_voice_time().unwrap();
        assert_eq!(last - start, Duration::from_millis(100));

        // 600ms of silence exceeds the timeout but not the minimum duration.
        let ds = h.feed_n(0.01, 30);
        assert!(ds.iter().all(|d| d.transition.is_none()));
        assert!(h.vad.is_voice());
    }

    #[test]
    fn long_episode_stops_after_silence_timeout() {
        let mut h = Harness::new();
        h.feed_n(0.15, 40);
        let ds = h.feed_n(0.01, 40);
        let stops: Vec<usize> = ds
            .iter()
            .enumerate()
            .filter(|(_, d)| d.transition == Some(VoiceTransition::Stopped))
            .map(|(i, _)| i)
            .collect();
        // Silent frame i (1-based) is 20*i ms after the last voice frame; 520 > 500.
        assert_eq!(stops, vec![25]);
        assert!(!h.vad.is_voice());
    }

    #[test]
    fn noise_floor_frozen_during_voice() {
        let mut h = Harness::new();
        h.feed_n(0.01, 12);
        let before = h.noise.len();
        h.feed_n(0.5, 20);
        // Only the debounce frames up to and including onset were recorded.
        assert_eq!(h.noise.len(), before + 5);
    }

    #[test]
    fn spike_counts_as_high_below_threshold() {
        let mut h = Harness::new();
        h.feed(0.035);
        // 0.09 < 0.10 threshold but > 2.5 * 0.035
        h.feed(0.09);
        assert_eq!(h.vad.consecutive_high_frames(), 1);
    }

    #[test]
    fn rolling_average_near_threshold_confirms_voice() {
        let mut h = Harness::new();
        // 0.095 is under the threshold but above 85% of it; the average
        // check needs three values in the window first.
        let ds = h.feed_n(0.095, 8);
        assert_eq!(starts(&ds), vec![6]);
    }

    #[test]
    fn decision_reports_threshold_and_background() {
        let mut h = Harness::new();
        let d = h.feed(0.01);
        assert_eq!(d.threshold, 0.10);
        assert_eq!(d.background_noise, 0.005);
        assert!(!d.is_voice_frame);
    }

    #[test]
    fn reset_returns_to_epoch() {
        let mut h = Harness::new();
        h.feed_n(0.15, 6);
        h.vad.reset_voice_state();
        assert!(!h.vad.is_voice());
        assert_eq!(h.vad.voice_start_time(), None);
        assert_eq!(h.vad.last_voice_time(), None);
        assert_eq!(h.vad.consecutive_high_frames(), 0);
        assert_eq!(h.vad.previous_rms(), 0.0);
    }
}
