//! Sensor ingestion service
//!
//! Subscribes to the configured MQTT topics and stores sensor measurements
//! and metadata.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sensor_ingest::service::{delivery_channel, IngestService};
use sensor_ingest::store::InMemorySensorStore;
use sensor_ingest::transport::MqttTransport;
use sensor_ingest::{logging, Settings};

#[derive(Debug, Parser)]
#[command(name = "sensor-ingest", version, about = "MQTT sensor telemetry ingestion")]
struct Args {
    /// Path to the TOML settings file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::from_file(&args.config)
        .with_context(|| format!("failed to load settings from {}", args.config.display()))?;
    settings.apply_env_overrides()?;
    if let Some(level) = args.log_level {
        settings.logging.level = level;
    }
    settings.validate()?;

    logging::init(&settings.logging);
    info!(
        config = %args.config.display(),
        host = %settings.mqtt.host,
        port = settings.mqtt.port,
        client_id = %settings.mqtt.client_id,
        "sensor-ingest starting"
    );

    let cancel = CancellationToken::new();
    let (tx, rx) = delivery_channel(&settings);
    let transport = Arc::new(MqttTransport::start(&settings.mqtt, tx, cancel.clone())?);
    let store = Arc::new(InMemorySensorStore::new());

    let service = IngestService::new(settings, store, transport, rx, cancel)?;
    let shutdown = service.shutdown_handle();

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c; shutting down"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c; shutting down"),
        }
        shutdown.shutdown().await;
    });

    let stats = service.run().await?;
    info!(
        dispatched = stats.dispatched,
        acked = stats.acked,
        unacked = stats.unacked,
        "sensor-ingest stopped"
    );
    Ok(())
}
