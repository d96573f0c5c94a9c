#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, AMQP in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Scan Relay
//!
//! Reliable relay from barcode/QR scan stations to downstream side effects.
//!
//! ## Overview
//!
//! A producer reads `AREA,STATION` scans from an acquisition source and publishes
//! them to a durable RabbitMQ queue. A consumer pulls each event and runs two
//! actions concurrently: an HTTP notification and a database mutation delegated
//! to an external process. Deliveries are acknowledged only after both succeed.
//! Transient failures are requeued with bounded exponential backoff; permanent
//! failures, malformed payloads and exhausted retries go to a dead-letter queue.
//!
//! ## Architecture
//!
//! ```text
//! AcquisitionSource -> ProducerLoop -> QueueClient (durable queue)
//!                                          |
//!                       Subscription workers (1..N)
//!                                          |
//!                                ConsumerDispatcher
//!                     decode -> idempotency claim -> ActionExecutor
//!                                          |
//!                           Ack | Requeue(delay) | DeadLetter
//! ```
//!
//! ## Module Organization
//!
//! - [`messaging`] - Scan codec, queue client trait, RabbitMQ and in-memory providers
//! - [`producer`] - Acquisition sources and the buffered publish loop
//! - [`executor`] - HTTP notification and process mutation actions
//! - [`dispatcher`] - Delivery state machine, retry policy, idempotency guard
//! - [`bootstrap`] - Consumer wiring and shutdown signal handling
//! - [`config`] - Layered configuration (defaults, TOML file, environment)
//! - [`error`] - Top-level error type
//! - [`logging`] - Tracing initialization and structured outcome records
//!
//! ## Quick Start
//!
//! ```rust
//! use scan_relay::messaging::ScanEvent;
//!
//! let event: ScanEvent = " OP7 , S500 ".parse().unwrap();
//! assert_eq!(event.area(), "OP7");
//! assert_eq!(event.canonical(), "OP7,S500");
//! ```

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod logging;
pub mod messaging;
pub mod producer;

pub use bootstrap::{shutdown_signal, ConsumerBootstrap, ConsumerHandle};
pub use config::{ConfigLoader, ConfigurationError, RelayConfig};
pub use dispatcher::{ConsumerDispatcher, DeliveryState, DispatcherStats, RetryPolicy};
pub use error::{RelayError, Result};
pub use executor::{ActionExecutor, ActionOutcome, OutcomeKind, ScanAction};
pub use messaging::{
    AckDecision, Delivery, InMemoryQueueClient, MessageHandler, QueueClient,
    RabbitMqQueueClient, ScanEvent,
};
pub use producer::{ProducerLoop, ProducerStats};
