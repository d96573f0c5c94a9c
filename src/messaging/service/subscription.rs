//! # Subscription Workers
//!
//! Runs N worker loops against one shared [`QueueClient`]. Each worker pulls a
//! delivery, awaits the handler's decision, and settles the delivery before
//! pulling the next one. Cancellation stops the pull; a delivery already handed
//! to the handler is always finished and settled.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::traits::{MessageHandler, QueueClient};

/// Pause after a receive error before pulling again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Running set of subscription workers
#[derive(Debug)]
pub struct Subscription {
    queue_name: String,
    workers: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Subscription {
    /// Spawn `workers` loops (at least one) feeding `handler`
    ///
    /// The subscription stops when `cancel` is cancelled or when the client
    /// reports that it is closed.
    pub fn start(
        client: Arc<dyn QueueClient>,
        handler: Arc<dyn MessageHandler>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        let tracker = TaskTracker::new();
        let queue_name = client.queue_name().to_string();

        for worker_id in 0..workers {
            let client = Arc::clone(&client);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                worker_loop(worker_id, client, handler, cancel).await;
            });
        }
        tracker.close();

        info!(
            queue = %queue_name,
            workers = workers,
            "Subscription started"
        );

        Self {
            queue_name,
            workers,
            cancel,
            tracker,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Token that stops the workers
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether every worker has exited
    pub fn is_finished(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Stop pulling and wait for in-flight deliveries to be settled
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait for the workers to exit on their own
    pub async fn join(self) {
        self.tracker.wait().await;
        info!(queue = %self.queue_name, "Subscription stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    client: Arc<dyn QueueClient>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    debug!(worker_id, queue = %client.queue_name(), "Subscription worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = client.next_delivery() => next,
        };

        match next {
            Ok(Some(delivery)) => {
                let decision = handler.handle(&delivery).await;
                let receipt = delivery.receipt().clone();
                let label = decision.label();
                if let Err(e) = client.settle(delivery, decision).await {
                    warn!(
                        worker_id,
                        receipt = %receipt,
                        decision = label,
                        error = %e,
                        "Failed to settle delivery; broker will redeliver it"
                    );
                }
            }
            Ok(None) => {
                debug!(worker_id, "Queue client closed");
                break;
            }
            Err(e) => {
                error!(worker_id, error = %e, "Failed to receive delivery");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    debug!(worker_id, "Subscription worker stopped");
}
