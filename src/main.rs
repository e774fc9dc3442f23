//! smartmic daemon: listen on the default microphone, log voice activity and
//! gain decisions until Ctrl-C.
//!
//! Usage: smartmic [--json-logs] [--config <path>]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use smartmic::{
    init_tracing, CpalFrameSource, EngineConfig, EngineEvent, LoggingGainSink, VoiceGainEngine,
};

struct Args {
    json_logs: bool,
    config: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut args = Args {
        json_logs: false,
        config: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json-logs" => args.json_logs = true,
            "--config" => args.config = iter.next().map(PathBuf::from),
            other => eprintln!("ignoring unknown argument: {other}"),
        }
    }
    args
}

fn load_config(path: Option<&PathBuf>) -> EngineConfig {
    let Some(path) = path else {
        return EngineConfig::default();
    };
    match EngineConfig::load_from_file(path) {
        Ok(cfg) => {
            info!(path = %path.display(), "config loaded");
            cfg
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            EngineConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args();
    init_tracing(args.json_logs);
    info!("smartmic starting");

    let config = load_config(args.config.as_ref());
    let source = Box::new(CpalFrameSource::new(config.capture.clone()));
    let engine = match VoiceGainEngine::new(
        config,
        source,
        Arc::new(LoggingGainSink),
        tokio::runtime::Handle::current(),
    ) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "engine rejected its configuration");
            return;
        }
    };

    // Drain events on a plain thread; the receiver is a blocking crossbeam channel.
    let subscription = engine.subscribe();
    let drain = thread::Builder::new()
        .name("event-log".into())
        .spawn(move || {
            for event in subscription.receiver.iter() {
                match &event {
                    EngineEvent::VoiceActivityChanged { .. } => {
                        tracing::trace!(?event, "engine_event");
                    }
                    _ => info!(?event, "engine_event"),
                }
            }
        });
    if let Err(e) = &drain {
        warn!(error = %e, "failed to spawn event log thread");
    }

    if !engine.enable() {
        error!("microphone unavailable, exiting");
        return;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for ctrl-c");
    }

    let stats = engine.stats();
    info!(
        background_noise = stats.background_noise,
        threshold = stats.current_threshold,
        gain = stats.current_gain,
        "final engine stats"
    );
    match serde_json::to_string(&engine.metrics().summary()) {
        Ok(summary) => info!(%summary, "timing summary"),
        Err(e) => warn!(error = %e, "failed to serialize metrics"),
    }

    engine.disable();
    info!("smartmic stopped");
}
