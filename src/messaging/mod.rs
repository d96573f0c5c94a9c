//! # Messaging Module
//!
//! Wire codec for scan events and the durable work queue client.

pub mod codec;
pub mod errors;
pub mod service;

pub use codec::{decode, encode, MalformedMessage, MalformedReason, ScanEvent};
pub use errors::{MessagingError, MessagingResult, PublishError};
pub use service::{
    subscribe, AckDecision, Delivery, InMemoryQueueClient, MessageHandler, QueueClient,
    QueueStats, RabbitMqQueueClient, ReceiptHandle, Subscription,
};
