//! Listening sessions: CancellationToken + generation guard.
//! Every enable starts a new generation; capture callbacks and the gain tick
//! task hold a guard and stop doing work once their generation is stale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Issues one token per listening session. Advancing cancels the previous one.
pub struct SessionGeneration {
    current_token: RwLock<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl SessionGeneration {
    pub fn new() -> Self {
        let token = CancellationToken::new();
        // Nothing is listening before the first enable.
        token.cancel();
        Self {
            current_token: RwLock::new(token),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel the current session, start a new one and return its guard.
    pub fn cancel_and_advance(&self) -> GenerationGuard {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        let new_root = CancellationToken::new();
        let child = new_root.child_token();
        *token_guard = new_root;
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        GenerationGuard::new(Arc::clone(&self.generation), gen, child)
    }

    /// Bumped by every enable; compared before applying deferred work.
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cancel the current session without advancing the generation.
    pub fn cancel_all(&self) {
        self.current_token.read().cancel();
    }
}

impl Default for SessionGeneration {
    fn default() -> Self {
        Self::new()
    }
}

/// Checked by session-bound work before touching shared state.
#[derive(Clone)]
pub struct GenerationGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    fn new(generation: Arc<AtomicU64>, my_generation: u64, token: CancellationToken) -> Self {
        Self {
            generation,
            my_generation,
            token,
        }
    }

    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Not cancelled and still the current session.
    #[inline]
    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}
