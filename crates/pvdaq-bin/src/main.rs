//! Headless acquisition daemon.
//!
//! Composition root only: loads the TOML configuration, builds one engine
//! per configured instrument over its serial port, attaches the matching
//! instrument strategy, and runs until Ctrl-C.
//!
//! ```bash
//! RUST_LOG=info pvdaq --config lab.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;

use pvdaq_core::connection::PortOpener;
use pvdaq_core::serial::{open_serial_async, DynPort};
use pvdaq_core::{
    AppConfig, Engine, EngineError, EventLevel, Instrument, InstrumentConfig, JsonFileStore,
    JsonlSink, MeasurementSink, Notifier, StatusPersistence,
};
use pvdaq_tracker::TrackerInstrument;

#[derive(Parser)]
#[command(name = "pvdaq", about = "Solar-cell tracker acquisition daemon", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, default_value = "pvdaq.toml")]
    config: PathBuf,

    /// JSON-lines file measurements are appended to.
    #[arg(long, default_value = "pvdaq-measurements.jsonl")]
    measurements: PathBuf,
}

fn serial_opener(config: &InstrumentConfig) -> PortOpener {
    let port = config.port.clone();
    let baud = config.baud;
    let id = config.id.clone();
    Arc::new(move || {
        let port = port.clone();
        let id = id.clone();
        Box::pin(async move {
            let stream = open_serial_async(&port, baud, &id)
                .await
                .map_err(|e| EngineError::Transport(std::io::Error::other(e)))?;
            Ok(Box::new(stream) as DynPort)
        })
    })
}

fn instrument_for(config: &InstrumentConfig) -> Result<Arc<dyn Instrument>> {
    match config.kind.as_str() {
        "tracker" => Ok(Arc::new(TrackerInstrument::new())),
        other => bail!("instrument '{}' has unknown kind '{}'", config.id, other),
    }
}

/// Forwards broadcast events to the log so a headless run leaves a trace of
/// alerts and state changes.
fn spawn_event_logger(notifier: &Notifier) {
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.level {
                    EventLevel::Alert => tracing::warn!(?event, "instrument alert"),
                    EventLevel::Info => tracing::info!(?event, "instrument event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let app = AppConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if app.instruments.is_empty() {
        bail!("no instruments configured in {}", cli.config.display());
    }

    let persistence: Arc<dyn StatusPersistence> =
        Arc::new(JsonFileStore::new(&app.status_file));
    let sink: Arc<dyn MeasurementSink> = Arc::new(JsonlSink::new(&cli.measurements));
    let notifier = Notifier::default();
    spawn_event_logger(&notifier);

    let mut engines = Vec::new();
    for config in app.instruments {
        if config.has_reset_line {
            tracing::warn!(
                instrument = %config.id,
                "has_reset_line is set but this build wires no reset-line driver"
            );
        }
        let instrument = instrument_for(&config)?;
        let opener = serial_opener(&config);
        let id = config.id.clone();
        let engine = Engine::new(
            config,
            opener,
            None,
            Arc::clone(&persistence),
            Arc::clone(&sink),
            notifier.clone(),
        );
        engine
            .attach(instrument)
            .await
            .with_context(|| format!("attaching instrument '{}'", id))?;
        tracing::info!(instrument = %id, "instrument attached");
        engines.push(engine);
    }

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutting down");
    for engine in &engines {
        engine.detach().await;
    }
    Ok(())
}
