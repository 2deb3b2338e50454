/// Wake-word stream alignment service binary
///
/// Standalone service that captures audio, aligns it against the
/// reference stream from the external producer and reports keyword
/// offsets over the synchronization channels.

use std::path::PathBuf;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber;
use wakeword_aligner::{
    load_wake_engine, CpalCaptureSource, EnergyCommandEngine, LogNotifier, Pipeline,
    PipelineConfig, PosixQueueTransport,
};

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakeword_aligner=info".parse().unwrap()),
        )
        .init();

    let notify = match parse_args(std::env::args().skip(1)) {
        Ok(notify) => notify,
        Err(arg) => {
            eprintln!("unrecognized argument: {}", arg);
            eprintln!("usage: wakeword-aligner [--notify]");
            std::process::exit(1);
        }
    };

    info!("Starting wake-word stream alignment service");

    if let Err(e) = run(notify) {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

fn run(notify: bool) -> anyhow::Result<()> {
    let mut config = load_config().context("failed to load configuration")?;
    config.notify_detections = notify;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    // Two periods of slack between the device callback and the cycle loop.
    let capture = CpalCaptureSource::open(config.sample_rate, 2 * config.period_frames)
        .context("failed to open audio capture")?;
    let transport = PosixQueueTransport::open(&config.queues, config.hop_frames)
        .context("failed to open synchronization channels")?;

    let primary = load_wake_engine(config.engine_path.as_deref());
    let fallback = EnergyCommandEngine::open(config.fallback.clone(), primary.is_none());

    let mut pipeline = Pipeline::new(
        config,
        capture,
        transport,
        primary,
        Box::new(fallback),
        Box::new(LogNotifier),
    )?;

    info!("Pipeline running");
    pipeline.run()?;
    Ok(())
}

/// `--notify` (or `-notify`, for producer compatibility) is the only
/// accepted argument; anything else is a usage error.
fn parse_args<I: Iterator<Item = String>>(args: I) -> Result<bool, String> {
    let mut notify = false;
    for arg in args {
        match arg.as_str() {
            "--notify" | "-notify" => notify = true,
            other => return Err(other.to_string()),
        }
    }
    Ok(notify)
}

/// Load configuration from a JSON file named by `WAKEWORD_ALIGNER_CONFIG`,
/// falling back to defaults; `WAKE_ENGINE_PATH` overrides the engine
/// module path either way.
fn load_config() -> anyhow::Result<PipelineConfig> {
    let mut config = match std::env::var("WAKEWORD_ALIGNER_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse config file {}", path))?
        }
        Err(_) => PipelineConfig::default(),
    };

    if let Ok(path) = std::env::var("WAKE_ENGINE_PATH") {
        config.engine_path = Some(PathBuf::from(path));
    }

    Ok(config)
}
