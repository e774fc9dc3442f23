//! smartmic: voice activity detection + adaptive microphone gain.
//! Main library: module wiring and tracing setup.

pub mod config;
pub mod error;
pub mod state_machine;
pub mod cancellation;
pub mod metrics;
pub mod events;
pub mod audio;
pub mod gain;
pub mod engine;

pub use audio::{CpalFrameSource, FrameCallback, FrameSource};
pub use config::{CaptureConfig, EngineConfig, GainConfig, VadConfig};
pub use engine::{EngineStats, VoiceGainEngine};
pub use error::EngineError;
pub use events::{EngineEvent, Subscription, SubscriptionId};
pub use gain::{GainAdjustment, GainSink, LoggingGainSink};
pub use state_machine::EngineLifecycle;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("smartmic=debug"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
