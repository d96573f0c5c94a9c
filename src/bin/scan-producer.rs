//! # Scan Producer
//!
//! Reads newline-delimited `AREA,STATION` scans from stdin or `--input` (a file
//! or FIFO fed by the scanner driver) and publishes them to the scan queue.
//!
//! ## Usage
//!
//! ```bash
//! printf 'OP7,S500\n' | scan-producer --config config/scan-relay.example.toml
//! scan-producer --input /run/scanner/fifo
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scan_relay::bootstrap::shutdown_signal;
use scan_relay::config::{ConfigLoader, ProducerConfig};
use scan_relay::logging;
use scan_relay::messaging::{QueueClient, RabbitMqQueueClient};
use scan_relay::producer::{AcquisitionSource, LineSource, ProducerLoop, ProducerStats};

#[derive(Parser, Debug)]
#[command(name = "scan-producer")]
#[command(about = "Publish scan events to the durable scan queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SCAN_RELAY_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Read scans from this file or FIFO instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();

    let config = ConfigLoader::load(cli.config.as_deref()).context("loading configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.rabbitmq.connection_url_redacted(),
        queue = %config.rabbitmq.queue,
        input = ?cli.input,
        "Starting scan producer"
    );

    // Scans read while the broker is still unreachable wait in the publish buffer
    let client: Arc<dyn QueueClient> = Arc::new(RabbitMqQueueClient::new(&config.rabbitmq, 1));
    match client.ensure_queue().await {
        Ok(()) => info!("Connected to RabbitMQ"),
        Err(e) => warn!(error = %e, "RabbitMQ unavailable at startup; buffering until it returns"),
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let result = match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            run(Arc::clone(&client), LineSource::new(file), config.producer, cancel).await
        }
        None => {
            run(
                Arc::clone(&client),
                LineSource::new(tokio::io::stdin()),
                config.producer,
                cancel,
            )
            .await
        }
    };

    client.close().await.context("closing RabbitMQ connection")?;
    let stats = result?;
    info!(
        scanned = stats.scanned,
        published = stats.published,
        rejected = stats.rejected,
        dropped = stats.dropped,
        "Scan producer shutdown complete"
    );
    Ok(())
}

async fn run<S: AcquisitionSource>(
    client: Arc<dyn QueueClient>,
    source: S,
    config: ProducerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<ProducerStats> {
    ProducerLoop::new(client, source, config)
        .run(cancel)
        .await
        .context("producer loop failed")
}
