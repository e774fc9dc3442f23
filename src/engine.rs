//! The voice/gain engine: one owned instance per application.
//!
//! Two contexts drive it. The capture side calls the frame callback every
//! 20 ms; a tokio task ticks the gain controller every 200 ms. Both go through
//! the single `state` mutex. Voice events are published inside the frame's
//! critical section (unbounded channels never block), which keeps them in
//! frame order. The gain sink is never called under the state lock; sink calls
//! are serialized among themselves so the last one reflects the lifecycle.

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::noise::NoiseEstimator;
use crate::audio::vad::{compute_rms, VoiceActivityDetector, VoiceTransition};
use crate::audio::{FrameCallback, FrameSource};
use crate::cancellation::{GenerationGuard, SessionGeneration};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus, Subscription, SubscriptionId};
use crate::gain::{apply_level, GainAdjustment, GainController, GainSink};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::state_machine::{EngineLifecycle, LifecycleMachine};

/// Bounds for values passed to [`VoiceGainEngine::configure_thresholds`].
const MIN_CONFIGURED_THRESHOLD: f32 = 0.001;
const MAX_CONFIGURED_THRESHOLD: f32 = 1.0;

/// Snapshot returned by [`VoiceGainEngine::stats`]. Timestamps are `None`
/// until voice has been seen since the last reset.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub lifecycle: EngineLifecycle,
    pub is_listening: bool,
    pub is_paused: bool,
    pub is_voice_detected: bool,
    pub current_threshold: f32,
    pub background_noise: f32,
    pub last_voice_time: Option<Instant>,
    pub voice_start_time: Option<Instant>,
    pub consecutive_high_frames: u32,
    pub noise_samples: usize,
    pub current_gain: f32,
    pub target_gain: f32,
    pub is_user_speaking: bool,
    pub session_id: Option<Uuid>,
}

/// Everything both execution contexts read and write.
struct SharedState {
    lifecycle: LifecycleMachine,
    noise: NoiseEstimator,
    vad: VoiceActivityDetector,
    gain: GainController,
    session_id: Option<Uuid>,
}

impl SharedState {
    fn new(config: &EngineConfig) -> Self {
        Self {
            lifecycle: LifecycleMachine::new(),
            noise: NoiseEstimator::new(&config.vad),
            vad: VoiceActivityDetector::new(&config.vad),
            gain: GainController::new(config.gain.clone()),
            session_id: None,
        }
    }

    fn clear_transient(&mut self) {
        self.noise.clear();
        self.vad.clear();
        self.gain.reset();
    }

    /// Run one frame through detection and gain targeting.
    fn analyze(&mut self, samples: &[f32], now: Instant) -> Result<Vec<EngineEvent>, EngineError> {
        if samples.is_empty() {
            return Err(EngineError::InvalidFrame("empty frame".into()));
        }
        let rms = compute_rms(samples);
        if !rms.is_finite() {
            return Err(EngineError::InvalidFrame("non-finite samples".into()));
        }

        let decision = self.vad.process(rms, &mut self.noise, now);
        let mut events = Vec::with_capacity(2);
        match decision.transition {
            Some(VoiceTransition::Started) => {
                self.gain.on_voice_started();
                events.push(EngineEvent::VoiceActivityStarted);
            }
            Some(VoiceTransition::Stopped) => {
                self.gain.on_voice_stopped();
                events.push(EngineEvent::VoiceActivityStopped);
            }
            None => {}
        }
        self.gain.on_voice_changed(decision.rms, decision.background_noise);
        events.push(EngineEvent::VoiceActivityChanged {
            rms: decision.rms,
            threshold: decision.threshold,
            is_voice_detected: decision.is_voice_frame,
            background_noise: decision.background_noise,
        });
        Ok(events)
    }
}

struct EngineInner {
    config: EngineConfig,
    state: Mutex<SharedState>,
    /// Also serializes enable/disable.
    source: Mutex<Box<dyn FrameSource>>,
    sink: Arc<dyn GainSink>,
    /// Held for every sink call; the tick re-checks the lifecycle under it.
    apply_lock: Mutex<()>,
    events: EventBus,
    sessions: SessionGeneration,
    metrics: Arc<MetricsRegistry>,
    runtime: Handle,
}

impl EngineInner {
    fn enable(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut source = self.source.lock();
        if self.state.lock().lifecycle.current().is_listening() {
            debug!("already listening");
            return Ok(());
        }

        if !source.is_available() {
            return Err(EngineError::DeviceUnavailable);
        }

        let guard = self.sessions.cancel_and_advance();
        if let Err(e) = source.start(frame_callback(Arc::downgrade(self), guard.clone())) {
            self.sessions.cancel_all();
            return Err(e);
        }

        let session_id = Uuid::new_v4();
        {
            let mut state = self.state.lock();
            state.lifecycle.transition(EngineLifecycle::Enabled)?;
            state.clear_transient();
            state.session_id = Some(session_id);
        }

        spawn_control_loop(self, guard.clone());
        info!(
            session_id = %session_id,
            generation = guard.my_generation(),
            "listening_started"
        );
        Ok(())
    }

    /// Stop ticking and capture, forget history, restore the normal level.
    fn disable(&self) {
        let mut source = self.source.lock();
        let normal = {
            let mut state = self.state.lock();
            if !state.lifecycle.current().is_listening() {
                return;
            }
            let _ = state.lifecycle.transition(EngineLifecycle::Disabled);
            self.sessions.cancel_all();
            state.clear_transient();
            state.session_id = None;
            state.gain.normal_level()
        };

        source.stop();
        drop(source);

        let _applying = self.apply_lock.lock();
        self.apply(normal);
        info!("listening_stopped");
    }

    fn process_frame_at(&self, samples: &[f32], now: Instant) {
        let started = Instant::now();
        {
            let mut state = self.state.lock();
            // Paused and disabled periods have no side effects at all.
            if state.lifecycle.current() != EngineLifecycle::Enabled {
                return;
            }
            match state.analyze(samples, now) {
                Ok(events) => self.events.publish_all(&events),
                Err(e) => {
                    warn!(error = %e, "frame dropped");
                    return;
                }
            }
        }
        self.metrics.record(
            metric_names::FRAME_ANALYSIS,
            started.elapsed().as_micros() as f64,
        );
    }

    fn tick(&self) -> Option<GainAdjustment> {
        let span = self.metrics.span(metric_names::GAIN_TICK);
        let adjustment = self.step_and_apply();
        span.finish();
        adjustment
    }

    fn step_and_apply(&self) -> Option<GainAdjustment> {
        let (adjustment, generation) = {
            let mut state = self.state.lock();
            if !state.lifecycle.current().is_listening() {
                return None;
            }
            (state.gain.tick()?, self.sessions.current_generation())
        };

        // A disable (or re-enable) between the step and the sink call wins.
        let _applying = self.apply_lock.lock();
        {
            let state = self.state.lock();
            if !state.lifecycle.current().is_listening()
                || self.sessions.current_generation() != generation
            {
                debug!(level = adjustment.current_level, "gain step superseded");
                return None;
            }
        }

        self.apply(adjustment.current_level);
        self.events.publish(&EngineEvent::GainAdjusted {
            current_level: adjustment.current_level,
            target_level: adjustment.target_level,
            is_user_speaking: adjustment.is_user_speaking,
        });
        Some(adjustment)
    }

    fn apply(&self, level: f32) -> bool {
        let span = self.metrics.span(metric_names::GAIN_APPLY);
        let applied = apply_level(self.sink.as_ref(), level);
        span.finish();
        applied
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let listening = self.state.get_mut().lifecycle.current().is_listening();
        // Ticks hold an upgraded handle, so none can be in flight here.
        if listening {
            self.sessions.cancel_all();
            self.source.get_mut().stop();
            let normal = self.config.gain.normal_level;
            apply_level(self.sink.as_ref(), normal);
            info!("engine dropped while listening, microphone restored");
        }
    }
}

fn frame_callback(inner: Weak<EngineInner>, guard: GenerationGuard) -> FrameCallback {
    Box::new(move |samples: &[f32]| {
        if !guard.should_continue() {
            return;
        }
        if let Some(inner) = inner.upgrade() {
            inner.process_frame_at(samples, Instant::now());
        }
    })
}

/// Periodic gain smoothing for one listening session.
fn spawn_control_loop(inner: &Arc<EngineInner>, guard: GenerationGuard) {
    let weak = Arc::downgrade(inner);
    let period = inner.config.gain.tick_interval();

    inner.runtime.spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = guard.token().cancelled() => break,
                _ = interval.tick() => {
                    if !guard.should_continue() {
                        break;
                    }
                    let Some(inner) = weak.upgrade() else { break };
                    inner.tick();
                }
            }
        }
        debug!(generation = guard.my_generation(), "gain control loop stopped");
    });
}

/// Cloneable handle; the last handle dropped while listening disables.
#[derive(Clone)]
pub struct VoiceGainEngine {
    inner: Arc<EngineInner>,
}

impl VoiceGainEngine {
    /// `runtime` hosts the periodic gain task. Fails on an invalid config.
    pub fn new(
        config: EngineConfig,
        source: Box<dyn FrameSource>,
        sink: Arc<dyn GainSink>,
        runtime: Handle,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let state = SharedState::new(&config);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                state: Mutex::new(state),
                source: Mutex::new(source),
                sink,
                apply_lock: Mutex::new(()),
                events: EventBus::new(),
                sessions: SessionGeneration::new(),
                metrics: Arc::new(MetricsRegistry::new()),
                runtime,
            }),
        })
    }

    /// Start capture and the gain loop. Returns false if the device is
    /// missing or capture could not start; nothing changes in that case.
    pub fn enable(&self) -> bool {
        match self.inner.enable() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "enable failed");
                false
            }
        }
    }

    pub fn disable(&self) {
        self.inner.disable();
    }

    /// Skip per-frame analysis; the device stays open and the loop keeps ticking.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle.current() == EngineLifecycle::Enabled {
            let _ = state.lifecycle.transition(EngineLifecycle::Paused);
        } else {
            debug!(lifecycle = %state.lifecycle.current(), "pause ignored");
        }
    }

    /// Resume analysis from a clean Silence state.
    pub fn resume(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle.current() != EngineLifecycle::Paused {
            debug!(lifecycle = %state.lifecycle.current(), "resume ignored");
            return;
        }
        let _ = state.lifecycle.transition(EngineLifecycle::Enabled);
        state.vad.reset_voice_state();
        state.gain.on_voice_stopped();
    }

    /// Override the current voice threshold, clamped to [0.001, 1.0]. The
    /// override holds until the next noise-floor update recomputes it.
    /// `silence_threshold` is only logged; the silence floor is fixed by config.
    pub fn configure_thresholds(&self, voice_threshold: f32, silence_threshold: f32) {
        if !voice_threshold.is_finite() {
            warn!(voice_threshold, "ignoring non-finite voice threshold");
            return;
        }
        let voice = voice_threshold.clamp(MIN_CONFIGURED_THRESHOLD, MAX_CONFIGURED_THRESHOLD);
        let mut state = self.inner.state.lock();
        state.noise.override_threshold(voice);
        info!(voice, silence = silence_threshold, "thresholds_configured");
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.inner.state.lock();
        let lifecycle = state.lifecycle.current();
        EngineStats {
            lifecycle,
            is_listening: lifecycle.is_listening(),
            is_paused: lifecycle == EngineLifecycle::Paused,
            is_voice_detected: state.vad.is_voice(),
            current_threshold: state.noise.adaptive_threshold(),
            background_noise: state.noise.background_noise(),
            last_voice_time: state.vad.last_voice_time(),
            voice_start_time: state.vad.voice_start_time(),
            consecutive_high_frames: state.vad.consecutive_high_frames(),
            noise_samples: state.noise.len(),
            current_gain: state.gain.current(),
            target_gain: state.gain.target(),
            is_user_speaking: state.gain.is_user_speaking(),
            session_id: state.session_id,
        }
    }

    /// Feed one normalized frame received now.
    pub fn process_frame(&self, samples: &[f32]) {
        self.inner.process_frame_at(samples, Instant::now());
    }

    /// Feed one normalized frame with an explicit arrival time.
    pub fn process_frame_at(&self, samples: &[f32], now: Instant) {
        self.inner.process_frame_at(samples, now);
    }

    /// One gain smoothing step, as the periodic loop does.
    pub fn tick(&self) -> Option<GainAdjustment> {
        self.inner.tick()
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<EngineLifecycle> {
        self.inner.state.lock().lifecycle.subscribe()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}
