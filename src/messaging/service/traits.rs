//! # Queue Client Traits
//!
//! Provider-agnostic operations on the single durable work queue.

use async_trait::async_trait;

use super::types::{AckDecision, Delivery, QueueStats};
use crate::messaging::errors::{MessagingError, PublishError};

/// Durable, at-least-once work queue
///
/// Implementations own their broker connection and are shared as
/// `Arc<dyn QueueClient>` between the producer or the subscription workers.
/// Manual acknowledgment only: a delivery stays unsettled until
/// [`QueueClient::settle`] is called with the handler's decision.
#[async_trait]
pub trait QueueClient: Send + Sync + 'static {
    /// Name of the work queue
    fn queue_name(&self) -> &str;

    /// Declare the work queue and its dead-letter route (idempotent)
    async fn ensure_queue(&self) -> Result<(), MessagingError>;

    /// Publish one persistent message
    ///
    /// Performs one reconnect-and-retry on connection loss before returning
    /// [`PublishError::Unavailable`].
    async fn publish(&self, body: &[u8]) -> Result<(), PublishError>;

    /// Wait for the next delivery
    ///
    /// Returns `Ok(None)` once the client is closed. Connection-level errors
    /// are handled by reconnecting inside the provider where possible.
    async fn next_delivery(&self) -> Result<Option<Delivery>, MessagingError>;

    /// Finalize a delivery according to the handler's decision
    async fn settle(&self, delivery: Delivery, decision: AckDecision)
        -> Result<(), MessagingError>;

    /// Queue depth and session counters
    async fn queue_stats(&self) -> Result<QueueStats, MessagingError>;

    /// Verify the backend is reachable
    async fn health_check(&self) -> Result<bool, MessagingError>;

    /// Flush pending settlements and close the connection
    async fn close(&self) -> Result<(), MessagingError>;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}

/// Processes one delivery and decides how it is settled
///
/// Handlers never settle deliveries themselves; the subscription applies the
/// returned decision through the queue client.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> AckDecision;
}
