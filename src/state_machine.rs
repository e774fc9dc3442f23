//! Engine lifecycle: Disabled → Enabled ⇄ Paused → Disabled.
//! Paused keeps the capture device open and the gain loop ticking; only the
//! per-frame analysis is skipped.

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngineLifecycle {
    Disabled,
    Enabled,
    Paused,
}

impl std::fmt::Display for EngineLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineLifecycle::Disabled => write!(f, "Disabled"),
            EngineLifecycle::Enabled => write!(f, "Enabled"),
            EngineLifecycle::Paused => write!(f, "Paused"),
        }
    }
}

impl EngineLifecycle {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: EngineLifecycle) -> bool {
        matches!(
            (self, next),
            (EngineLifecycle::Disabled, EngineLifecycle::Enabled)
                | (EngineLifecycle::Enabled, EngineLifecycle::Paused)
                | (EngineLifecycle::Paused, EngineLifecycle::Enabled)
                | (EngineLifecycle::Enabled, EngineLifecycle::Disabled)
                | (EngineLifecycle::Paused, EngineLifecycle::Disabled)
        )
    }

    /// Capture is open and the control loop runs.
    pub fn is_listening(self) -> bool {
        !matches!(self, EngineLifecycle::Disabled)
    }
}

/// Lifecycle holder with a watch channel for reactive subscribers.
/// Not internally locked: it lives inside the engine's shared state.
pub struct LifecycleMachine {
    state: EngineLifecycle,
    state_tx: watch::Sender<EngineLifecycle>,
}

impl LifecycleMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(EngineLifecycle::Disabled);
        Self {
            state: EngineLifecycle::Disabled,
            state_tx,
        }
    }

    pub fn current(&self) -> EngineLifecycle {
        self.state
    }

    /// Attempt a transition. Returns the new state or the rejected pair.
    pub fn transition(&mut self, next: EngineLifecycle) -> Result<EngineLifecycle, EngineError> {
        let current = self.state;
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "invalid lifecycle transition");
            return Err(EngineError::InvalidTransition { from: current, to: next });
        }
        self.state = next;
        self.state_tx.send_replace(next);
        info!(from = %current, to = %next, "lifecycle_transition");
        Ok(next)
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineLifecycle> {
        self.state_tx.subscribe()
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}
