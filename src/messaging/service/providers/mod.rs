//! # Queue Client Providers
//!
//! Concrete implementations of the `QueueClient` trait.
//!
//! ## Providers
//!
//! - [`RabbitMqQueueClient`] - RabbitMQ via the lapin crate
//! - [`InMemoryQueueClient`] - Thread-safe in-memory queue for tests and local runs

mod in_memory;
mod rabbitmq;

pub use in_memory::{DeadLetterRecord, InMemoryQueueClient};
pub use rabbitmq::RabbitMqQueueClient;
