//! # Consumer Dispatcher
//!
//! Decides the fate of every delivery:
//!
//! ```text
//! Received -> Decoding -> Executing -> { Acked | Requeued | DeadLettered }
//!                 |            ^
//!                 |            +-- idempotency claim (duplicates are acked, in-flight requeued)
//!                 +-- malformed -> DeadLettered
//! ```
//!
//! The dispatcher only borrows a delivery. It returns an [`AckDecision`] and the
//! subscription applies it through the queue client.

pub mod idempotency;
pub mod retry;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{ConfigResult, RelayConfig};
use crate::executor::{ActionExecutor, OutcomeKind};
use crate::logging::{log_dead_letter, log_delivery_outcome};
use crate::messaging::codec;
use crate::messaging::service::{AckDecision, Delivery, MessageHandler};

pub use idempotency::{ClaimOutcome, IdempotencyGuard, InMemoryIdempotencyGuard};
pub use retry::RetryPolicy;

/// Per-delivery processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Received,
    Decoding,
    Executing,
    Acked,
    Requeued,
    DeadLettered,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryState::Received => "received",
            DeliveryState::Decoding => "decoding",
            DeliveryState::Executing => "executing",
            DeliveryState::Acked => "acked",
            DeliveryState::Requeued => "requeued",
            DeliveryState::DeadLettered => "dead_lettered",
        };
        f.write_str(name)
    }
}

/// Final state of a delivery and the decision to apply
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub state: DeliveryState,
    pub decision: AckDecision,
}

/// Snapshot of dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub received: u64,
    pub acked: u64,
    pub duplicates: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct DispatcherCounters {
    received: AtomicU64,
    acked: AtomicU64,
    duplicates: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    malformed: AtomicU64,
}

/// Decodes, deduplicates, executes and classifies deliveries
pub struct ConsumerDispatcher {
    executor: ActionExecutor,
    guard: Arc<dyn IdempotencyGuard>,
    retry: RetryPolicy,
    queue_name: String,
    counters: DispatcherCounters,
}

impl fmt::Debug for ConsumerDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDispatcher")
            .field("executor", &self.executor)
            .field("retry", &self.retry)
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

impl ConsumerDispatcher {
    pub fn new(
        executor: ActionExecutor,
        guard: Arc<dyn IdempotencyGuard>,
        retry: RetryPolicy,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            guard,
            retry,
            queue_name: queue_name.into(),
            counters: DispatcherCounters::default(),
        }
    }

    /// Production wiring: HTTP notifier, process mutation, in-memory guard
    pub fn from_config(config: &RelayConfig) -> ConfigResult<Self> {
        let executor = ActionExecutor::from_config(config)?;
        let guard = Arc::new(InMemoryIdempotencyGuard::new(
            config.dispatcher.idempotency_retention(),
        ));
        Ok(Self::new(
            executor,
            guard,
            RetryPolicy::from_config(&config.dispatcher),
            &config.rabbitmq.queue,
        ))
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            received: self.counters.received.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }

    /// Process one delivery and decide how it is settled
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.trace_state(delivery, DeliveryState::Received);
        self.trace_state(delivery, DeliveryState::Decoding);

        let event = match codec::decode(delivery.body()) {
            Ok(event) => event,
            Err(malformed) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                return self
                    .dead_letter(delivery, format!("malformed message: {}", malformed.reason));
            }
        };

        let key = event.canonical();
        match self.guard.try_claim(&key) {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyCompleted => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                return self.ack(delivery, "duplicate of a completed event");
            }
            ClaimOutcome::InFlight => {
                debug!(key = %key, "Event is being processed by another worker");
                return self.requeue(
                    delivery,
                    self.retry.base,
                    "event in flight on another worker",
                );
            }
        }

        self.trace_state(delivery, DeliveryState::Executing);
        let result = self.executor.execute(&event).await;
        let detail = result.detail();

        match result.kind {
            OutcomeKind::Success => {
                self.guard.complete(&key);
                self.ack(delivery, &detail)
            }
            OutcomeKind::TransientFailure => {
                self.guard.release(&key);
                let attempt = delivery.attempt();
                if self.retry.should_retry(attempt) {
                    self.requeue(delivery, self.retry.backoff_for(attempt), &detail)
                } else {
                    self.dead_letter(
                        delivery,
                        format!("retries exhausted after {} attempts: {}", attempt, detail),
                    )
                }
            }
            OutcomeKind::PermanentFailure => {
                self.guard.release(&key);
                self.dead_letter(delivery, format!("permanent failure: {}", detail))
            }
        }
    }

    fn trace_state(&self, delivery: &Delivery, state: DeliveryState) {
        debug!(
            receipt = %delivery.receipt(),
            attempt = delivery.attempt(),
            state = %state,
            "Delivery state"
        );
    }

    fn ack(&self, delivery: &Delivery, detail: &str) -> DispatchOutcome {
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        self.finish(delivery, DeliveryState::Acked, AckDecision::Ack, detail)
    }

    fn requeue(
        &self,
        delivery: &Delivery,
        delay: std::time::Duration,
        detail: &str,
    ) -> DispatchOutcome {
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        warn!(
            receipt = %delivery.receipt(),
            attempt = delivery.attempt(),
            delay_ms = delay.as_millis() as u64,
            detail = %detail,
            "Requeueing delivery"
        );
        self.finish(
            delivery,
            DeliveryState::Requeued,
            AckDecision::requeue(delay),
            detail,
        )
    }

    fn dead_letter(&self, delivery: &Delivery, reason: String) -> DispatchOutcome {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        let payload = delivery.payload_lossy();
        log_dead_letter(
            &self.queue_name,
            delivery.receipt().as_str(),
            delivery.attempt(),
            &payload,
            &reason,
        );
        let outcome = DispatchOutcome {
            state: DeliveryState::DeadLettered,
            decision: AckDecision::dead_letter(reason),
        };
        log_delivery_outcome(
            &self.queue_name,
            delivery.receipt().as_str(),
            delivery.attempt(),
            &payload,
            &outcome.state.to_string(),
            Some(&outcome.decision.to_string()),
        );
        outcome
    }

    fn finish(
        &self,
        delivery: &Delivery,
        state: DeliveryState,
        decision: AckDecision,
        detail: &str,
    ) -> DispatchOutcome {
        log_delivery_outcome(
            &self.queue_name,
            delivery.receipt().as_str(),
            delivery.attempt(),
            &delivery.payload_lossy(),
            &state.to_string(),
            Some(detail),
        );
        DispatchOutcome { state, decision }
    }
}

#[async_trait]
impl MessageHandler for ConsumerDispatcher {
    async fn handle(&self, delivery: &Delivery) -> AckDecision {
        self.dispatch(delivery).await.decision
    }
}
