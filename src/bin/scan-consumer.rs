//! # Scan Consumer
//!
//! Subscribes to the scan queue and runs the dispatcher until SIGINT/SIGTERM.
//!
//! ## Usage
//!
//! ```bash
//! scan-consumer --config config/scan-relay.example.toml --workers 4
//!
//! # Print the merged configuration (credentials masked) and exit
//! scan-consumer --config config/scan-relay.example.toml --print-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use scan_relay::bootstrap::{shutdown_signal, ConsumerBootstrap};
use scan_relay::config::ConfigLoader;
use scan_relay::logging;
use scan_relay::messaging::{QueueClient, RabbitMqQueueClient};

#[derive(Parser, Debug)]
#[command(name = "scan-consumer")]
#[command(about = "Consume scan events and run notification and mutation actions")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SCAN_RELAY_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Concurrent workers; overrides `dispatcher.workers`
    #[arg(short, long)]
    workers: Option<usize>,

    /// Print the merged configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();

    let mut config = ConfigLoader::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(workers) = cli.workers {
        config.dispatcher.workers = workers;
        config.validate().context("validating --workers")?;
    }

    if cli.print_config {
        let sanitized = ConfigLoader::sanitize_config_for_logging(&config);
        println!("{}", serde_json::to_string_pretty(&sanitized)?);
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.rabbitmq.connection_url_redacted(),
        queue = %config.rabbitmq.queue,
        notification = %config.notification.base_url,
        mutation = %config.mutation.program,
        workers = config.dispatcher.workers,
        "Starting scan consumer"
    );

    let client: Arc<dyn QueueClient> = Arc::new(
        RabbitMqQueueClient::connect(&config.rabbitmq, config.dispatcher.workers)
            .await
            .context("connecting to RabbitMQ")?,
    );
    let handle = ConsumerBootstrap::start(&config, client)
        .await
        .context("starting consumer")?;

    info!("Consumer running; press Ctrl+C to stop");
    shutdown_signal().await;
    info!("Shutdown signal received, draining in-progress deliveries");

    match handle.shutdown().await {
        Ok(stats) => {
            info!(
                acked = stats.acked,
                requeued = stats.requeued,
                dead_lettered = stats.dead_lettered,
                "Scan consumer shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Consumer did not shut down cleanly");
            Err(e.into())
        }
    }
}
