//! # Queue Client Types
//!
//! Deliveries, settlement decisions and statistics shared by every provider.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Handle for settling a received message
///
/// The format is provider-specific:
/// - RabbitMQ: `<connection generation>:<delivery tag>`
/// - InMemory: internal UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    /// Create a new receipt handle
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReceiptHandle {
    fn from(handle: String) -> Self {
        Self(handle)
    }
}

impl From<&str> for ReceiptHandle {
    fn from(handle: &str) -> Self {
        Self(handle.to_string())
    }
}

/// A message received from the work queue
///
/// Owned by the queue client until settled; handlers only borrow it.
#[derive(Debug, Clone)]
pub struct Delivery {
    body: Vec<u8>,
    receipt: ReceiptHandle,
    attempt: u32,
    redelivered: bool,
}

impl Delivery {
    /// Create a delivery; `attempt` is clamped to at least 1
    pub fn new(body: Vec<u8>, receipt: ReceiptHandle, attempt: u32, redelivered: bool) -> Self {
        Self {
            body,
            receipt,
            attempt: attempt.max(1),
            redelivered,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn receipt(&self) -> &ReceiptHandle {
        &self.receipt
    }

    /// 1 for the first delivery, incremented on every requeue
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Broker flagged this as a redelivery of an unsettled message
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Body as text, with invalid UTF-8 replaced
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// How the queue client must finalize a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum AckDecision {
    /// Processing finished; remove the message
    Ack,
    /// Deliver again with attempt + 1 after `delay`
    Requeue { delay: Duration },
    /// Route to the dead-letter queue with the failure detail
    DeadLetter { reason: String },
}

impl AckDecision {
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue { delay }
    }

    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Self::DeadLetter {
            reason: reason.into(),
        }
    }

    /// Short name for logs and counters
    pub fn label(&self) -> &'static str {
        match self {
            AckDecision::Ack => "ack",
            AckDecision::Requeue { .. } => "requeue",
            AckDecision::DeadLetter { .. } => "dead_letter",
        }
    }
}

impl fmt::Display for AckDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckDecision::Ack => write!(f, "ack"),
            AckDecision::Requeue { delay } => write!(f, "requeue after {}ms", delay.as_millis()),
            AckDecision::DeadLetter { reason } => write!(f, "dead_letter: {reason}"),
        }
    }
}

/// Queue statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Queue name
    pub queue_name: String,

    /// Messages ready in the live queue
    pub message_count: u64,

    /// Messages waiting in the dead-letter queue, when the provider can tell
    pub dead_letter_count: Option<u64>,

    /// Session counters of this client
    pub published: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl QueueStats {
    /// Create new queue stats
    pub fn new(queue_name: impl Into<String>, message_count: u64) -> Self {
        Self {
            queue_name: queue_name.into(),
            message_count,
            ..Default::default()
        }
    }

    /// Set the dead-letter count
    pub fn with_dead_letter_count(mut self, count: u64) -> Self {
        self.dead_letter_count = Some(count);
        self
    }

    /// Copy the session counters
    pub fn with_counters(mut self, counters: &SessionCounters) -> Self {
        self.published = counters.published.load(Ordering::Relaxed);
        self.acked = counters.acked.load(Ordering::Relaxed);
        self.requeued = counters.requeued.load(Ordering::Relaxed);
        self.dead_lettered = counters.dead_lettered.load(Ordering::Relaxed);
        self
    }
}

/// Lock-free session counters kept by each provider
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub published: AtomicU64,
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl SessionCounters {
    /// Count a settlement decision
    pub fn record(&self, decision: &AckDecision) {
        let counter = match decision {
            AckDecision::Ack => &self.acked,
            AckDecision::Requeue { .. } => &self.requeued,
            AckDecision::DeadLetter { .. } => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_attempt_is_one_based() {
        let delivery = Delivery::new(b"OP7,S500".to_vec(), ReceiptHandle::from("r1"), 0, false);
        assert_eq!(delivery.attempt(), 1);
        assert_eq!(delivery.payload_lossy(), "OP7,S500");
        assert_eq!(delivery.receipt().as_str(), "r1");
    }

    #[test]
    fn test_ack_decision_labels() {
        assert_eq!(AckDecision::Ack.label(), "ack");
        assert_eq!(AckDecision::requeue(Duration::from_secs(1)).label(), "requeue");
        assert_eq!(AckDecision::dead_letter("boom").label(), "dead_letter");
        assert_eq!(
            AckDecision::requeue(Duration::from_millis(250)).to_string(),
            "requeue after 250ms"
        );
    }

    #[test]
    fn test_queue_stats_with_counters() {
        let counters = SessionCounters::default();
        counters.record_publish();
        counters.record(&AckDecision::Ack);
        counters.record(&AckDecision::dead_letter("x"));

        let stats = QueueStats::new("qrscan", 3)
            .with_dead_letter_count(1)
            .with_counters(&counters);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.dead_letter_count, Some(1));
    }
}
