//! # In-Memory Queue Client
//!
//! Thread-safe in-memory work queue for tests and local development.
//!
//! ## Features
//!
//! - **Manual acknowledgment**: received messages stay in flight until settled
//! - **Delayed requeue**: `Requeue { delay }` hides the message for `delay`
//!   and bumps its attempt counter
//! - **Inspectable dead letters**: dead-lettered messages are kept in a list
//! - **Outage simulation**: [`InMemoryQueueClient::set_available`] makes
//!   publishes fail with [`PublishError::Unavailable`], and
//!   [`InMemoryQueueClient::requeue_in_flight`] returns unsettled messages to
//!   the queue the way a broker does when a consumer connection drops

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::messaging::errors::{MessagingError, PublishError};
use crate::messaging::service::traits::QueueClient;
use crate::messaging::service::types::{
    AckDecision, Delivery, QueueStats, ReceiptHandle, SessionCounters,
};

/// Stored message with its delivery bookkeeping
#[derive(Debug, Clone)]
struct InMemoryMessage {
    id: u64,
    body: Vec<u8>,
    attempt: u32,
    redelivered: bool,
}

/// Message hidden until `visible_at`
#[derive(Debug)]
struct DelayedMessage {
    visible_at: Instant,
    message: InMemoryMessage,
}

/// Dead-lettered message kept for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub body: Vec<u8>,
    pub attempt: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Body as text, with invalid UTF-8 replaced
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug)]
struct QueueState {
    ready: VecDeque<InMemoryMessage>,
    delayed: Vec<DelayedMessage>,
    in_flight: HashMap<String, InMemoryMessage>,
    dead_letters: Vec<DeadLetterRecord>,
    available: bool,
    closed: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            delayed: Vec::new(),
            in_flight: HashMap::new(),
            dead_letters: Vec::new(),
            available: true,
            closed: false,
        }
    }

    /// Move delayed messages whose time has come to the ready queue
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|d| d.visible_at);
        let due = self.delayed.partition_point(|d| d.visible_at <= now);
        for delayed in self.delayed.drain(..due) {
            self.ready.push_back(delayed.message);
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.delayed.iter().map(|d| d.visible_at).min()
    }
}

/// In-memory queue client
///
/// # Example
///
/// ```rust
/// use scan_relay::messaging::service::providers::InMemoryQueueClient;
/// use scan_relay::messaging::service::{AckDecision, QueueClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = InMemoryQueueClient::new("qrscan");
/// client.ensure_queue().await?;
/// client.publish(b"OP7,S500").await?;
///
/// if let Some(delivery) = client.next_delivery().await? {
///     assert_eq!(delivery.attempt(), 1);
///     client.settle(delivery, AckDecision::Ack).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryQueueClient {
    queue_name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    next_id: AtomicU64,
    counters: SessionCounters,
}

impl InMemoryQueueClient {
    /// Create an empty queue
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            counters: SessionCounters::default(),
        }
    }

    /// Dead-lettered messages, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.state.lock().dead_letters.clone()
    }

    /// Messages visible to consumers now
    pub fn ready_len(&self) -> usize {
        let mut state = self.state.lock();
        state.promote_due(Instant::now());
        state.ready.len()
    }

    /// Messages waiting out a requeue delay
    pub fn delayed_len(&self) -> usize {
        let mut state = self.state.lock();
        state.promote_due(Instant::now());
        state.delayed.len()
    }

    /// Delivered but not yet settled
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Ready, delayed and in-flight messages
    pub fn total_len(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.delayed.len() + state.in_flight.len()
    }

    /// Simulate a broker outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
        debug!(queue = %self.queue_name, available, "In-memory broker availability changed");
    }

    /// Return every unsettled message to the front of the queue
    ///
    /// Models a consumer crash: the broker redelivers with the redelivered
    /// flag set and the same attempt. Receipts of the returned messages become
    /// unknown.
    pub fn requeue_in_flight(&self) -> usize {
        let returned = {
            let mut state = self.state.lock();
            let mut returned: Vec<InMemoryMessage> =
                state.in_flight.drain().map(|(_, message)| message).collect();
            returned.sort_by_key(|m| std::cmp::Reverse(m.id));
            let count = returned.len();
            for mut message in returned {
                message.redelivered = true;
                state.ready.push_front(message);
            }
            count
        };
        self.notify.notify_waiters();
        returned
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn ensure_queue(&self) -> Result<(), MessagingError> {
        if self.state.lock().closed {
            return Err(MessagingError::closed(&self.queue_name));
        }
        debug!(queue = %self.queue_name, "Ensured in-memory queue");
        Ok(())
    }

    async fn publish(&self, body: &[u8]) -> Result<(), PublishError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PublishError::closed(&self.queue_name));
            }
            if !state.available {
                return Err(PublishError::unavailable(
                    &self.queue_name,
                    "in-memory broker marked unavailable",
                ));
            }
            state.ready.push_back(InMemoryMessage {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                body: body.to_vec(),
                attempt: 1,
                redelivered: false,
            });
        }
        self.counters.record_publish();
        self.notify.notify_waiters();
        Ok(())
    }

    async fn next_delivery(&self) -> Result<Option<Delivery>, MessagingError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                if state.closed {
                    return Ok(None);
                }
                state.promote_due(Instant::now());
                if let Some(message) = state.ready.pop_front() {
                    let receipt = ReceiptHandle::new(Uuid::new_v4().to_string());
                    let delivery = Delivery::new(
                        message.body.clone(),
                        receipt.clone(),
                        message.attempt,
                        message.redelivered,
                    );
                    state.in_flight.insert(receipt.0, message);
                    return Ok(Some(delivery));
                }
                state.next_visible_at()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn settle(
        &self,
        delivery: Delivery,
        decision: AckDecision,
    ) -> Result<(), MessagingError> {
        {
            let mut state = self.state.lock();
            let mut message = state
                .in_flight
                .remove(delivery.receipt().as_str())
                .ok_or_else(|| MessagingError::unknown_receipt(delivery.receipt().as_str()))?;

            match &decision {
                AckDecision::Ack => {}
                AckDecision::Requeue { delay } => {
                    message.attempt = message.attempt.saturating_add(1);
                    message.redelivered = false;
                    if delay.is_zero() {
                        state.ready.push_back(message);
                    } else {
                        state.delayed.push(DelayedMessage {
                            visible_at: Instant::now() + *delay,
                            message,
                        });
                    }
                }
                AckDecision::DeadLetter { reason } => {
                    state.dead_letters.push(DeadLetterRecord {
                        body: message.body,
                        attempt: message.attempt,
                        reason: reason.clone(),
                        dead_lettered_at: Utc::now(),
                    });
                }
            }
        }

        self.counters.record(&decision);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats, MessagingError> {
        let (message_count, dead_letter_count) = {
            let state = self.state.lock();
            (
                (state.ready.len() + state.delayed.len()) as u64,
                state.dead_letters.len() as u64,
            )
        };
        Ok(QueueStats::new(&self.queue_name, message_count)
            .with_dead_letter_count(dead_letter_count)
            .with_counters(&self.counters))
    }

    async fn health_check(&self) -> Result<bool, MessagingError> {
        let state = self.state.lock();
        Ok(state.available && !state.closed)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        debug!(queue = %self.queue_name, "In-memory queue client closed");
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
