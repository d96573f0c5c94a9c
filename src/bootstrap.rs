//! # Consumer Bootstrap
//!
//! Wires the consumer side together: action executor, idempotency guard,
//! dispatcher and subscription workers over a shared queue client.
//!
//! ```ignore
//! let client: Arc<dyn QueueClient> =
//!     Arc::new(RabbitMqQueueClient::connect(&config.rabbitmq, config.dispatcher.workers).await?);
//! let handle = ConsumerBootstrap::start(&config, client).await?;
//! shutdown_signal().await;
//! handle.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::dispatcher::{ConsumerDispatcher, DispatcherStats, InMemoryIdempotencyGuard, RetryPolicy};
use crate::error::Result;
use crate::executor::ActionExecutor;
use crate::messaging::{subscribe, QueueClient, QueueStats, Subscription};

/// Shortest interval between idempotency purges
const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Builds and starts the consumer pipeline
#[derive(Debug)]
pub struct ConsumerBootstrap;

impl ConsumerBootstrap {
    /// Declare the queue topology and start the subscription workers
    pub async fn start(
        config: &RelayConfig,
        client: Arc<dyn QueueClient>,
    ) -> Result<ConsumerHandle> {
        let executor = ActionExecutor::from_config(config)?;
        let guard = Arc::new(InMemoryIdempotencyGuard::new(
            config.dispatcher.idempotency_retention(),
        ));
        let dispatcher = Arc::new(ConsumerDispatcher::new(
            executor,
            guard.clone(),
            RetryPolicy::from_config(&config.dispatcher),
            client.queue_name(),
        ));
        Self::start_with(client, dispatcher, guard, config.dispatcher.workers).await
    }

    /// Start with a caller-built dispatcher
    pub async fn start_with(
        client: Arc<dyn QueueClient>,
        dispatcher: Arc<ConsumerDispatcher>,
        guard: Arc<InMemoryIdempotencyGuard>,
        workers: usize,
    ) -> Result<ConsumerHandle> {
        client.ensure_queue().await?;

        let cancel = CancellationToken::new();
        let purge_task = spawn_purge_task(guard, cancel.child_token());
        let subscription = subscribe(
            Arc::clone(&client),
            dispatcher.clone(),
            workers,
            cancel.child_token(),
        );

        info!(
            queue = %client.queue_name(),
            provider = client.provider_name(),
            workers = subscription.workers(),
            "Consumer started"
        );

        Ok(ConsumerHandle {
            client,
            dispatcher,
            subscription,
            cancel,
            purge_task,
        })
    }
}

fn spawn_purge_task(
    guard: Arc<InMemoryIdempotencyGuard>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = guard.retention().max(MIN_PURGE_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    guard.purge_expired();
                }
            }
        }
    })
}

/// Running consumer
pub struct ConsumerHandle {
    client: Arc<dyn QueueClient>,
    dispatcher: Arc<ConsumerDispatcher>,
    subscription: Subscription,
    cancel: CancellationToken,
    purge_task: JoinHandle<()>,
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("queue", &self.client.queue_name())
            .field("provider", &self.client.provider_name())
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl ConsumerHandle {
    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(self.client.queue_stats().await?)
    }

    /// Token that stops the consumer when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether every subscription worker has exited on its own
    pub fn is_finished(&self) -> bool {
        self.subscription.is_finished()
    }

    /// Stop pulling, let in-progress deliveries settle, then close the client
    pub async fn shutdown(self) -> Result<DispatcherStats> {
        info!("Stopping consumer");
        self.cancel.cancel();
        self.subscription.shutdown().await;
        if let Err(e) = self.purge_task.await {
            warn!(error = %e, "Idempotency purge task ended abnormally");
        }

        match self.client.queue_stats().await {
            Ok(stats) => info!(
                queue = %stats.queue_name,
                remaining = stats.message_count,
                dead_letters = ?stats.dead_letter_count,
                acked = stats.acked,
                requeued = stats.requeued,
                dead_lettered = stats.dead_lettered,
                "Final queue statistics"
            ),
            Err(e) => warn!(error = %e, "Could not read final queue statistics"),
        }

        self.client.close().await?;
        let stats = self.dispatcher.stats();
        info!(
            received = stats.received,
            acked = stats.acked,
            duplicates = stats.duplicates,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        Ok(stats)
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
