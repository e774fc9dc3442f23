//! Error type shared by capture, analysis, gain control and config loading.

use thiserror::Error;

use crate::state_machine::EngineLifecycle;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Pre-flight check found no usable input device.
    #[error("no audio input device available")]
    DeviceUnavailable,

    #[error("audio capture error: {0}")]
    Capture(String),

    /// The external volume control rejected or failed the call.
    #[error("gain sink error: {0}")]
    GainSink(String),

    #[error("invalid audio frame: {0}")]
    InvalidFrame(String),

    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: EngineLifecycle,
        to: EngineLifecycle,
    },

    #[error("config IO error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
