//! # RabbitMQ Queue Client
//!
//! AMQP 0.9.1 implementation of [`QueueClient`] using the `lapin` crate.
//!
//! ## Features
//!
//! - **Durable queue and persistent messages** with publisher confirms
//! - **Dead letter exchange**: `<queue>_dlx` routes to `<queue>_dlq`; the live
//!   queue points at it so broker-side rejections land there too
//! - **Attempt tracking**: the `x-scan-attempt` header is carried across
//!   requeues, which are republish-then-ack
//! - **Reconnect**: publishes retry once on a fresh connection; the consumer
//!   side reconnects with bounded exponential backoff
//!
//! Receipts are `<generation>:<delivery tag>`. A delivery whose generation is
//! older than the live connection cannot be settled: the broker has already
//! requeued it when the old channel closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RabbitmqConfig;
use crate::constants::headers;
use crate::messaging::errors::{MessagingError, PublishError};
use crate::messaging::service::traits::QueueClient;
use crate::messaging::service::types::{
    AckDecision, Delivery, QueueStats, ReceiptHandle, SessionCounters,
};

/// One broker connection and its channel
#[derive(Debug)]
struct Session {
    generation: u64,
    connection: Connection,
    channel: Channel,
}

impl Session {
    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Names used on the broker for one work queue
#[derive(Debug, Clone)]
struct Topology {
    queue: String,
    dead_letter_exchange: String,
    dead_letter_queue: String,
}

impl Topology {
    fn from_config(config: &RabbitmqConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            dead_letter_exchange: config.dead_letter_exchange(),
            dead_letter_queue: config.dead_letter_queue(),
        }
    }
}

/// RabbitMQ-based queue client
pub struct RabbitMqQueueClient {
    config: RabbitmqConfig,
    topology: Topology,
    prefetch_count: u16,
    session: RwLock<Option<Arc<Session>>>,
    consumer: Mutex<Option<(u64, Consumer)>>,
    generation: AtomicU64,
    reconnect_delay: SyncMutex<Duration>,
    counters: Arc<SessionCounters>,
    pending_requeues: TaskTracker,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl fmt::Debug for RabbitMqQueueClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqQueueClient")
            .field("url", &self.config.connection_url_redacted())
            .field("queue", &self.topology.queue)
            .field("prefetch_count", &self.prefetch_count)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RabbitMqQueueClient {
    /// Client that connects on first use
    ///
    /// No I/O happens here; the first publish or delivery opens the session.
    /// Prefetch is raised to `workers` when the configured value is lower.
    pub fn new(config: &RabbitmqConfig, workers: usize) -> Self {
        let workers = u16::try_from(workers).unwrap_or(u16::MAX);
        Self {
            config: config.clone(),
            topology: Topology::from_config(config),
            prefetch_count: config.prefetch_count.max(workers),
            session: RwLock::new(None),
            consumer: Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnect_delay: SyncMutex::new(config.reconnect_initial_delay()),
            counters: Arc::new(SessionCounters::default()),
            pending_requeues: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect and declare the topology before returning
    pub async fn connect(config: &RabbitmqConfig, workers: usize) -> Result<Self, MessagingError> {
        let client = Self::new(config, workers);
        client.session().await?;

        info!(
            url = %config.connection_url_redacted(),
            queue = %client.topology.queue,
            prefetch = client.prefetch_count,
            "Connected to RabbitMQ"
        );
        Ok(client)
    }

    /// Effective consumer prefetch
    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    /// Current live session, reconnecting when there is none
    async fn session(&self) -> Result<Arc<Session>, MessagingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::closed(&self.topology.queue));
        }
        {
            let guard = self.session.read().await;
            if let Some(session) = guard.as_ref() {
                if session.is_connected() {
                    return Ok(Arc::clone(session));
                }
            }
        }

        let mut guard = self.session.write().await;
        // Another task may have reconnected while we waited for the lock
        if let Some(session) = guard.as_ref() {
            if session.is_connected() {
                return Ok(Arc::clone(session));
            }
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Arc::new(self.open_session(generation).await?);
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Drop the session of `generation` so the next call reconnects
    async fn invalidate(&self, generation: u64) {
        let mut guard = self.session.write().await;
        if guard.as_ref().map(|s| s.generation) == Some(generation) {
            debug!(generation, "Discarding RabbitMQ session");
            *guard = None;
        }
    }

    async fn open_session(&self, generation: u64) -> Result<Session, MessagingError> {
        let timeout = self.config.connection_timeout();
        let connection = tokio::time::timeout(
            timeout,
            Connection::connect(
                &self.config.url,
                ConnectionProperties::default()
                    .with_connection_name(self.config.connection_name.clone().into()),
            ),
        )
        .await
        .map_err(|_| MessagingError::timeout("connect", timeout.as_secs()))?
        .map_err(|e| MessagingError::connection(format!("RabbitMQ connection failed: {}", e)))?;

        let channel = connection.create_channel().await.map_err(|e| {
            MessagingError::connection(format!("RabbitMQ channel creation failed: {}", e))
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                MessagingError::configuration(
                    "rabbitmq",
                    format!("Failed to enable confirms: {}", e),
                )
            })?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| {
                MessagingError::configuration("rabbitmq", format!("Failed to set QoS: {}", e))
            })?;

        declare_topology(&channel, &self.topology).await?;

        debug!(generation, "Opened RabbitMQ session");
        Ok(Session {
            generation,
            connection,
            channel,
        })
    }

    async fn try_publish(&self, body: &[u8]) -> Result<(), MessagingError> {
        let session = self.session().await?;
        let result = publish_confirmed(
            &session.channel,
            "",
            &self.topology.queue,
            body,
            attempt_headers(1),
        )
        .await;
        if result.is_err() {
            self.invalidate(session.generation).await;
        }
        result
    }

    async fn start_consumer(&self) -> Result<(u64, Consumer), MessagingError> {
        let session = self.session().await?;
        let consumer_tag = format!("{}-{}", self.config.connection_name, Uuid::new_v4());
        let consumer = session
            .channel
            .basic_consume(
                &self.topology.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::receive(
                    &self.topology.queue,
                    format!("basic_consume failed: {}", e),
                )
            })?;

        info!(
            queue = %self.topology.queue,
            consumer_tag = %consumer_tag,
            generation = session.generation,
            "RabbitMQ consumer started"
        );
        Ok((session.generation, consumer))
    }

    /// Sleep the current reconnect delay, then double it up to the cap
    ///
    /// Returns `false` when shutdown interrupted the wait.
    async fn reconnect_backoff(&self) -> bool {
        let delay = {
            let mut current = self.reconnect_delay.lock();
            let delay = *current;
            *current = doubled_delay(*current, self.config.reconnect_max_delay());
            delay
        };
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before RabbitMQ reconnect");
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn reset_backoff(&self) {
        *self.reconnect_delay.lock() = self.config.reconnect_initial_delay();
    }

    /// Session that owns `receipt`, or `None` when it belongs to an older one
    async fn session_for(
        &self,
        receipt: &ReceiptHandle,
    ) -> Result<Option<(Arc<Session>, u64)>, MessagingError> {
        let (generation, tag) = parse_receipt(receipt)?;
        let guard = self.session.read().await;
        match guard.as_ref() {
            Some(session) if session.generation == generation && session.is_connected() => {
                Ok(Some((Arc::clone(session), tag)))
            }
            _ => Ok(None),
        }
    }

    async fn requeue(
        &self,
        session: Arc<Session>,
        tag: u64,
        delivery: Delivery,
        delay: Duration,
    ) -> Result<(), MessagingError> {
        let next_attempt = delivery.attempt().saturating_add(1);
        let queue = self.topology.queue.clone();

        if delay.is_zero() {
            return republish_and_ack(&session, &queue, tag, delivery.body(), next_attempt).await;
        }

        // The source delivery stays unacked during the delay, so a crash redelivers it
        let shutdown = self.shutdown.clone();
        let counters = Arc::clone(&self.counters);
        self.pending_requeues.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(tag, "Flushing delayed requeue on shutdown");
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if !session.is_connected() {
                warn!(
                    tag,
                    generation = session.generation,
                    "Connection lost before delayed requeue; broker will redeliver it"
                );
                return;
            }
            match republish_and_ack(&session, &queue, tag, delivery.body(), next_attempt).await {
                Ok(()) => counters.record(&AckDecision::requeue(delay)),
                Err(e) => error!(tag, error = %e, "Delayed requeue failed"),
            }
        });
        Ok(())
    }

    async fn dead_letter(
        &self,
        session: &Session,
        tag: u64,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<(), MessagingError> {
        let headers = dead_letter_headers(delivery.attempt(), reason, &self.topology.queue);
        let published = publish_confirmed(
            &session.channel,
            &self.topology.dead_letter_exchange,
            &self.topology.queue,
            delivery.body(),
            headers,
        )
        .await;

        match published {
            Ok(()) => session
                .channel
                .basic_ack(tag, BasicAckOptions::default())
                .await
                .map_err(|e| {
                    MessagingError::settlement("dead_letter", format!("ack failed: {}", e))
                }),
            Err(e) => {
                // The queue's own dead-letter exchange still routes the body to the DLQ
                warn!(tag, error = %e, "DLQ publish failed; rejecting to the dead-letter exchange");
                session
                    .channel
                    .basic_nack(
                        tag,
                        BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| {
                        MessagingError::settlement("dead_letter", format!("nack failed: {}", e))
                    })
            }
        }
    }
}

#[async_trait]
impl QueueClient for RabbitMqQueueClient {
    fn queue_name(&self) -> &str {
        &self.topology.queue
    }

    async fn ensure_queue(&self) -> Result<(), MessagingError> {
        let session = self.session().await?;
        declare_topology(&session.channel, &self.topology).await
    }

    async fn publish(&self, body: &[u8]) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::closed(&self.topology.queue));
        }

        let result = match self.try_publish(body).await {
            Ok(()) => Ok(()),
            Err(MessagingError::Closed { .. }) => {
                return Err(PublishError::closed(&self.topology.queue));
            }
            Err(first) => {
                warn!(error = %first, "Publish failed; reconnecting and retrying once");
                self.try_publish(body).await
            }
        };

        match result {
            Ok(()) => {
                self.counters.record_publish();
                Ok(())
            }
            Err(e) => Err(PublishError::unavailable(&self.topology.queue, e.to_string())),
        }
    }

    async fn next_delivery(&self) -> Result<Option<Delivery>, MessagingError> {
        let mut guard = self.consumer.lock().await;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            if guard.is_none() {
                match self.start_consumer().await {
                    Ok(consumer) => *guard = Some(consumer),
                    Err(MessagingError::Closed { .. }) => return Ok(None),
                    Err(e) => {
                        warn!(error = %e, "RabbitMQ consumer unavailable");
                        if !self.reconnect_backoff().await {
                            return Ok(None);
                        }
                        continue;
                    }
                }
            }

            let Some((generation, consumer)) = guard.as_mut() else {
                continue;
            };
            let generation = *generation;

            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    self.reset_backoff();
                    let attempt = attempt_from_properties(&message.properties);
                    return Ok(Some(Delivery::new(
                        message.data,
                        format_receipt(generation, message.delivery_tag),
                        attempt,
                        message.redelivered,
                    )));
                }
                Some(Err(e)) => {
                    warn!(generation, error = %e, "RabbitMQ consumer stream error");
                }
                None => {
                    warn!(generation, "RabbitMQ consumer stream ended");
                }
            }

            *guard = None;
            self.invalidate(generation).await;
            if !self.reconnect_backoff().await {
                return Ok(None);
            }
        }
    }

    async fn settle(
        &self,
        delivery: Delivery,
        decision: AckDecision,
    ) -> Result<(), MessagingError> {
        let Some((session, tag)) = self.session_for(delivery.receipt()).await? else {
            warn!(
                receipt = %delivery.receipt(),
                decision = decision.label(),
                "Delivery belongs to a previous connection; broker has requeued it"
            );
            return Ok(());
        };

        match &decision {
            AckDecision::Ack => {
                session
                    .channel
                    .basic_ack(tag, BasicAckOptions::default())
                    .await
                    .map_err(|e| MessagingError::settlement("ack", format!("ack failed: {}", e)))?;
                self.counters.record(&decision);
            }
            AckDecision::Requeue { delay } => {
                let delayed = !delay.is_zero();
                self.requeue(session, tag, delivery, *delay).await?;
                if !delayed {
                    self.counters.record(&decision);
                }
            }
            AckDecision::DeadLetter { reason } => {
                self.dead_letter(&session, tag, &delivery, reason).await?;
                self.counters.record(&decision);
            }
        }
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats, MessagingError> {
        let session = self.session().await?;
        let live = passive_message_count(&session.channel, &self.topology.queue).await?;
        let dead = passive_message_count(&session.channel, &self.topology.dead_letter_queue).await?;
        Ok(QueueStats::new(&self.topology.queue, live)
            .with_dead_letter_count(dead)
            .with_counters(&self.counters))
    }

    async fn health_check(&self) -> Result<bool, MessagingError> {
        match self.session().await {
            Ok(session) => Ok(session.is_connected()),
            Err(e) => {
                warn!(error = %e, "RabbitMQ health check failed");
                Ok(false)
            }
        }
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.pending_requeues.close();
        self.pending_requeues.wait().await;

        let session = self.session.write().await.take();
        if let Some(session) = session {
            session
                .connection
                .close(200, "scan-relay shutdown")
                .await
                .map_err(|e| MessagingError::connection(format!("close failed: {}", e)))?;
        }
        info!(queue = %self.topology.queue, "RabbitMQ queue client closed");
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}

/// Declare DLX, DLQ and the live queue (all durable, idempotent)
async fn declare_topology(channel: &Channel, topology: &Topology) -> Result<(), MessagingError> {
    channel
        .exchange_declare(
            &topology.dead_letter_exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            MessagingError::queue_creation(
                &topology.dead_letter_exchange,
                format!("DLX creation failed: {}", e),
            )
        })?;

    channel
        .queue_declare(
            &topology.dead_letter_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            MessagingError::queue_creation(
                &topology.dead_letter_queue,
                format!("DLQ creation failed: {}", e),
            )
        })?;

    // Routing key is the live queue name
    channel
        .queue_bind(
            &topology.dead_letter_queue,
            &topology.dead_letter_exchange,
            &topology.queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            MessagingError::queue_creation(
                &topology.dead_letter_queue,
                format!("DLQ binding failed: {}", e),
            )
        })?;

    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(topology.dead_letter_exchange.clone().into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(topology.queue.clone().into()),
    );

    channel
        .queue_declare(
            &topology.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await
        .map_err(|e| {
            MessagingError::queue_creation(&topology.queue, queue_declare_failure(&e.to_string()))
        })?;

    debug!(queue = %topology.queue, "Declared RabbitMQ topology");
    Ok(())
}

/// Persistent publish awaiting the broker's confirm
async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    headers: FieldTable,
) -> Result<(), MessagingError> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_content_type("text/plain".into())
                .with_headers(headers),
        )
        .await
        .map_err(|e| MessagingError::publish(routing_key, format!("Publish failed: {}", e)))?;

    let confirmation = confirm.await.map_err(|e| {
        MessagingError::publish(routing_key, format!("Publish confirmation failed: {}", e))
    })?;
    if confirmation.is_nack() {
        return Err(MessagingError::publish(routing_key, "broker nacked the publish"));
    }
    Ok(())
}

async fn republish_and_ack(
    session: &Session,
    queue: &str,
    tag: u64,
    body: &[u8],
    attempt: u32,
) -> Result<(), MessagingError> {
    let published =
        publish_confirmed(&session.channel, "", queue, body, attempt_headers(attempt)).await;
    if let Err(e) = published {
        warn!(tag, error = %e, "Requeue publish failed; returning delivery to the queue");
        return session
            .channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MessagingError::settlement("requeue", format!("nack failed: {}", e)));
    }

    session
        .channel
        .basic_ack(tag, BasicAckOptions::default())
        .await
        .map_err(|e| MessagingError::settlement("requeue", format!("ack failed: {}", e)))
}

async fn passive_message_count(channel: &Channel, queue: &str) -> Result<u64, MessagingError> {
    let state = channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::queue_stats(queue, format!("Queue query failed: {}", e)))?;
    Ok(u64::from(state.message_count()))
}

fn attempt_headers(attempt: u32) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(headers::ATTEMPT.into(), AMQPValue::LongLongInt(i64::from(attempt)));
    table
}

fn dead_letter_headers(attempt: u32, reason: &str, origin_queue: &str) -> FieldTable {
    let mut table = attempt_headers(attempt);
    table.insert(
        headers::FAILURE_DETAIL.into(),
        AMQPValue::LongString(reason.to_string().into()),
    );
    table.insert(
        headers::ORIGIN_QUEUE.into(),
        AMQPValue::LongString(origin_queue.to_string().into()),
    );
    table.insert(
        headers::DEAD_LETTERED_AT.into(),
        AMQPValue::LongString(Utc::now().to_rfc3339().into()),
    );
    table
}

/// Attempt carried in the message headers, 1 when absent or unreadable
fn attempt_from_properties(properties: &BasicProperties) -> u32 {
    properties
        .headers()
        .as_ref()
        .and_then(attempt_from_headers)
        .unwrap_or(1)
}

fn attempt_from_headers(table: &FieldTable) -> Option<u32> {
    let value = table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == headers::ATTEMPT)
        .map(|(_, value)| value)?;

    let attempt: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };
    u32::try_from(attempt).ok().filter(|a| *a >= 1)
}

fn format_receipt(generation: u64, delivery_tag: u64) -> ReceiptHandle {
    ReceiptHandle::new(format!("{generation}:{delivery_tag}"))
}

fn parse_receipt(receipt: &ReceiptHandle) -> Result<(u64, u64), MessagingError> {
    receipt
        .as_str()
        .split_once(':')
        .and_then(|(generation, tag)| Some((generation.parse().ok()?, tag.parse().ok()?)))
        .ok_or_else(|| MessagingError::invalid_receipt_handle(receipt.as_str()))
}

/// Failure message for the live queue declare, with a hint for legacy queues
///
/// A queue declared earlier without the dead-letter arguments (or as
/// non-durable) cannot be redeclared with them; the broker answers
/// `PRECONDITION_FAILED`.
fn queue_declare_failure(error: &str) -> String {
    if error.contains("PRECONDITION-FAILED") || error.contains("PRECONDITION_FAILED") {
        format!(
            "Queue creation failed: {}; an existing queue with different arguments \
             must be deleted or rabbitmq.queue pointed at a new name",
            error
        )
    } else {
        format!("Queue creation failed: {}", error)
    }
}

/// Next reconnect delay: twice `current`, never above `max`
fn doubled_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::codec;
    use crate::messaging::service::Subscription;
    use crate::messaging::service::MessageHandler;

    #[test]
    fn test_reconnect_delay_doubles_up_to_cap() {
        let max = Duration::from_secs(30);
        assert_eq!(doubled_delay(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(doubled_delay(Duration::from_secs(20), max), max);

        let huge = Duration::from_millis(u64::MAX);
        assert_eq!(doubled_delay(huge, huge), huge);
        assert_eq!(doubled_delay(Duration::MAX, Duration::MAX), Duration::MAX);
    }

    #[test]
    fn test_legacy_queue_declare_failure_explains_migration() {
        let message = queue_declare_failure(
            "protocol error: AMQP soft error: PRECONDITION-FAILED: \
             PRECONDITION_FAILED - inequivalent arg 'durable' for queue 'qrscan'",
        );
        assert!(message.starts_with("Queue creation failed: protocol error"));
        assert!(message.contains("must be deleted"));

        let message = queue_declare_failure("channel closed");
        assert_eq!(message, "Queue creation failed: channel closed");
    }

    #[tokio::test]
    async fn test_lazy_client_reports_unreachable_broker_as_unavailable() {
        let config = RabbitmqConfig {
            url: "amqp://127.0.0.1:1/%2F".to_string(),
            connection_timeout_secs: 2,
            ..Default::default()
        };
        let client = RabbitMqQueueClient::new(&config, 1);
        assert_eq!(client.prefetch_count(), config.prefetch_count.max(1));

        let result = client.publish(b"OP7,S500").await;
        assert!(
            matches!(
                result,
                Err(PublishError::Unavailable { ref queue_name, .. }) if queue_name == "qrscan"
            ),
            "{:?}",
            result
        );

        client.close().await.unwrap();
        assert_eq!(
            client.publish(b"OP7,S500").await,
            Err(PublishError::closed("qrscan"))
        );
    }

    #[tokio::test]
    #[ignore = "requires RabbitMQ running"]
    async fn test_rabbitmq_legacy_queue_declare_is_rejected_with_hint() {
        let config = test_config();
        let legacy = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .unwrap();
        let channel = legacy.create_channel().await.unwrap();
        channel
            .queue_declare(&config.queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .unwrap();

        let client = RabbitMqQueueClient::new(&config, 1);
        let err = client.ensure_queue().await.unwrap_err();
        assert!(err.to_string().contains("must be deleted"), "{}", err);

        channel
            .queue_delete(&config.queue, Default::default())
            .await
            .unwrap();
        legacy.close(200, "test done").await.unwrap();
    }

    #[test]
    fn test_receipt_round_trip() {
        let receipt = format_receipt(3, 42);
        assert_eq!(receipt.as_str(), "3:42");
        assert_eq!(parse_receipt(&receipt).unwrap(), (3, 42));
        assert!(parse_receipt(&ReceiptHandle::from("42")).is_err());
        assert!(parse_receipt(&ReceiptHandle::from("a:b")).is_err());
    }

    #[test]
    fn test_attempt_header_parsing() {
        assert_eq!(attempt_from_headers(&attempt_headers(4)), Some(4));
        assert_eq!(attempt_from_headers(&FieldTable::default()), None);

        let mut table = FieldTable::default();
        table.insert(headers::ATTEMPT.into(), AMQPValue::LongUInt(2));
        assert_eq!(attempt_from_headers(&table), Some(2));

        let mut table = FieldTable::default();
        table.insert(headers::ATTEMPT.into(), AMQPValue::LongInt(-1));
        assert_eq!(attempt_from_headers(&table), None);

        assert_eq!(attempt_from_properties(&BasicProperties::default()), 1);
    }

    #[test]
    fn test_dead_letter_headers() {
        let table = dead_letter_headers(5, "notification: HTTP 503", "qrscan");
        let keys: Vec<&str> = table.inner().keys().map(|k| k.as_str()).collect();
        assert!(keys.contains(&headers::ATTEMPT));
        assert!(keys.contains(&headers::FAILURE_DETAIL));
        assert!(keys.contains(&headers::ORIGIN_QUEUE));
        assert!(keys.contains(&headers::DEAD_LETTERED_AT));
        assert_eq!(attempt_from_headers(&table), Some(5));
    }

    // Integration tests require RabbitMQ to be running
    // docker run -d -p 5672:5672 rabbitmq:3
    // cargo test rabbitmq -- --ignored

    fn test_config() -> RabbitmqConfig {
        RabbitmqConfig {
            url: std::env::var("RABBITMQ_URL")
                .unwrap_or_else(|_| crate::constants::DEFAULT_RABBITMQ_URL.to_string()),
            queue: format!("scan_relay_test_{}", Uuid::new_v4()),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "requires RabbitMQ running"]
    async fn test_rabbitmq_publish_consume_ack() {
        let client = RabbitMqQueueClient::connect(&test_config(), 1).await.unwrap();
        client.ensure_queue().await.unwrap();
        client.ensure_queue().await.unwrap();

        let event = codec::ScanEvent::new("OP7", "S500").unwrap();
        client.publish(&codec::encode(&event)).await.unwrap();

        let delivery = client.next_delivery().await.unwrap().unwrap();
        assert_eq!(codec::decode(delivery.body()).unwrap(), event);
        assert_eq!(delivery.attempt(), 1);
        client.settle(delivery, AckDecision::Ack).await.unwrap();

        let stats = client.queue_stats().await.unwrap();
        assert_eq!(stats.message_count, 0);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.acked, 1);
        client.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires RabbitMQ running"]
    async fn test_rabbitmq_requeue_increments_attempt() {
        let client = RabbitMqQueueClient::connect(&test_config(), 1).await.unwrap();
        client.publish(b"OP7,S500").await.unwrap();

        let delivery = client.next_delivery().await.unwrap().unwrap();
        client
            .settle(delivery, AckDecision::requeue(Duration::from_millis(50)))
            .await
            .unwrap();

        let again = client.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.attempt(), 2);
        client.settle(again, AckDecision::Ack).await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires RabbitMQ running"]
    async fn test_rabbitmq_dead_letter_lands_in_dlq() {
        let client = RabbitMqQueueClient::connect(&test_config(), 1).await.unwrap();
        client.publish(b"garbage").await.unwrap();

        let delivery = client.next_delivery().await.unwrap().unwrap();
        client
            .settle(delivery, AckDecision::dead_letter("missing separator"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = client.queue_stats().await.unwrap();
        assert_eq!(stats.dead_letter_count, Some(1));
        assert_eq!(stats.dead_lettered, 1);
        client.close().await.unwrap();
    }

    struct AckAll;

    #[async_trait]
    impl MessageHandler for AckAll {
        async fn handle(&self, _delivery: &Delivery) -> AckDecision {
            AckDecision::Ack
        }
    }

    #[tokio::test]
    #[ignore = "requires RabbitMQ running"]
    async fn test_rabbitmq_subscription_drains_queue() {
        let client: Arc<RabbitMqQueueClient> =
            Arc::new(RabbitMqQueueClient::connect(&test_config(), 2).await.unwrap());
        assert!(client.prefetch_count() >= 2);
        for i in 0..5 {
            client.publish(format!("OP{i},S500").as_bytes()).await.unwrap();
        }

        let subscription = Subscription::start(
            client.clone(),
            Arc::new(AckAll),
            2,
            CancellationToken::new(),
        );
        for _ in 0..50 {
            if client.queue_stats().await.unwrap().acked == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        subscription.shutdown().await;
        assert_eq!(client.queue_stats().await.unwrap().acked, 5);
        client.close().await.unwrap();
    }
}
