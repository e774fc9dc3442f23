//! Engine events and their channel-based subscriber list.
//! Every subscriber owns an unbounded crossbeam receiver, so publishing never
//! blocks the capture thread or the control loop.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel as cb;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    VoiceActivityStarted,
    VoiceActivityStopped,
    /// Emitted for every analyzed frame. `is_voice_detected` is the
    /// debounced per-frame decision, not the Silence/Voice state.
    VoiceActivityChanged {
        rms: f32,
        threshold: f32,
        is_voice_detected: bool,
        background_noise: f32,
    },
    GainAdjusted {
        current_level: f32,
        target_level: f32,
        is_user_speaking: bool,
    },
}

pub type SubscriptionId = u64;

/// Receiving end handed to a subscriber.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: cb::Receiver<EngineEvent>,
}

pub struct EventBus {
    subscribers: Mutex<Vec<(SubscriptionId, cb::Sender<EngineEvent>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = cb::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, tx));
        debug!(subscription = id, "event_subscribed");
        Subscription { id, receiver: rx }
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        before != subs.len()
    }

    /// Deliver to every subscriber in order; drops subscribers whose receiver is gone.
    pub fn publish(&self, event: &EngineEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|(id, tx)| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(subscription = *id, "subscriber_dropped");
                false
            }
        });
    }

    pub fn publish_all(&self, events: &[EngineEvent]) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
