//! # Queue Client Abstraction Layer
//!
//! Provider-agnostic access to the single durable work queue, shared as
//! `Arc<dyn QueueClient>`.
//!
//! ## Architecture
//!
//! ```text
//! QueueClient (trait)
//!   ├── RabbitMqQueueClient     <- production, AMQP 0.9.1
//!   └── InMemoryQueueClient     <- tests and local development
//!
//! Subscription                  <- N workers: pull -> MessageHandler -> settle
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let client: Arc<dyn QueueClient> = Arc::new(RabbitMqQueueClient::connect(&config, 1).await?);
//! client.ensure_queue().await?;
//! client.publish(b"OP7,S500").await?;
//!
//! let subscription = subscribe(client.clone(), handler, 1, cancel.child_token());
//! // ...
//! subscription.shutdown().await;
//! client.close().await?;
//! ```

pub mod providers;
mod subscription;
mod traits;
mod types;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use providers::{DeadLetterRecord, InMemoryQueueClient, RabbitMqQueueClient};
pub use subscription::Subscription;
pub use traits::{MessageHandler, QueueClient};
pub use types::{AckDecision, Delivery, QueueStats, ReceiptHandle, SessionCounters};

pub use super::errors::{MessagingError, MessagingResult, PublishError};

/// Start `workers` subscription workers feeding `handler` from `client`
pub fn subscribe(
    client: Arc<dyn QueueClient>,
    handler: Arc<dyn MessageHandler>,
    workers: usize,
    cancel: CancellationToken,
) -> Subscription {
    Subscription::start(client, handler, workers, cancel)
}
