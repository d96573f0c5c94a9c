//! # Producer Loop
//!
//! Reads scans from an [`AcquisitionSource`], validates them, and publishes
//! them until cancelled or until the source closes.
//!
//! While the broker is unavailable, events wait in a bounded in-order buffer
//! that is retried with exponential backoff. New scans queue behind buffered
//! ones so publish order follows scan order. When the buffer is full the
//! oldest event is dropped and an `OPERATOR_ALERT` names it.

mod source;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProducerConfig;
use crate::error::{RelayError, Result};
use crate::logging::log_operator_alert;
use crate::messaging::{codec, PublishError, QueueClient};

pub use source::{
    AcquisitionSource, BlockingSource, LineSource, SourceError, SourcePoll, MAX_LINE_LENGTH,
};

const COMPONENT: &str = "producer";

/// Retry deadline used when the configured delay does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Counters reported when the loop exits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    /// Raw scans read from the source
    pub scanned: u64,
    /// Events confirmed by the broker
    pub published: u64,
    /// Malformed scans skipped
    pub rejected: u64,
    /// Events still buffered at exit
    pub buffered: u64,
    /// Events lost to buffer overflow or shutdown
    pub dropped: u64,
}

/// Cancellable acquisition-to-queue loop
pub struct ProducerLoop<S> {
    client: Arc<dyn QueueClient>,
    source: S,
    config: ProducerConfig,
    buffer: VecDeque<Vec<u8>>,
    retry_delay: Duration,
    retry_at: Option<Instant>,
    stats: ProducerStats,
}

impl<S> std::fmt::Debug for ProducerLoop<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerLoop")
            .field("queue", &self.client.queue_name())
            .field("buffered", &self.buffer.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<S: AcquisitionSource> ProducerLoop<S> {
    pub fn new(client: Arc<dyn QueueClient>, source: S, config: ProducerConfig) -> Self {
        let retry_delay = config.publish_retry_initial();
        Self {
            client,
            source,
            config,
            buffer: VecDeque::new(),
            retry_delay,
            retry_at: None,
            stats: ProducerStats::default(),
        }
    }

    /// Run until `cancel` fires or the source closes and the buffer drains
    ///
    /// On shutdown one last flush is attempted; events still buffered after it
    /// are reported as lost.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ProducerStats> {
        info!(
            queue = %self.client.queue_name(),
            buffer_capacity = self.config.buffer_capacity,
            "Producer loop started"
        );

        let mut source_open = true;
        let outcome: Result<()> = loop {
            if !source_open && self.buffer.is_empty() {
                info!("Acquisition source closed and buffer drained");
                break Ok(());
            }

            let retry_pending = self.retry_at.is_some() && !self.buffer.is_empty();
            let retry_at = self.retry_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Producer loop cancelled");
                    break Ok(());
                }
                _ = tokio::time::sleep_until(retry_at), if retry_pending => {
                    if let Err(e) = self.flush_buffer().await {
                        break Err(e.into());
                    }
                }
                poll = self.source.next_scan(), if source_open => {
                    match poll {
                        Ok(SourcePoll::Scan(raw)) => {
                            if let Err(e) = self.accept(raw).await {
                                break Err(e.into());
                            }
                        }
                        Ok(SourcePoll::Empty) => {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                            }
                        }
                        Ok(SourcePoll::Closed) => {
                            source_open = false;
                        }
                        Err(e) if e.is_recoverable() => {
                            self.stats.scanned += 1;
                            self.stats.rejected += 1;
                            warn!(error = %e, "Skipping unreadable scan");
                        }
                        Err(e) => {
                            error!(error = %e, "Acquisition source failed");
                            break Err(RelayError::from(e));
                        }
                    }
                }
            }
        };

        if !self.buffer.is_empty() && !matches!(outcome, Err(RelayError::Publish(_))) {
            if let Err(e) = self.flush_buffer().await {
                warn!(error = %e, "Final flush failed");
            }
        }
        self.abandon_buffer("shutdown");

        info!(
            scanned = self.stats.scanned,
            published = self.stats.published,
            rejected = self.stats.rejected,
            dropped = self.stats.dropped,
            "Producer loop stopped"
        );
        outcome.map(|()| self.stats)
    }

    /// Validate one raw scan and publish or buffer it
    async fn accept(&mut self, raw: String) -> std::result::Result<(), PublishError> {
        self.stats.scanned += 1;
        let event = match codec::decode(raw.as_bytes()) {
            Ok(event) => event,
            Err(malformed) => {
                self.stats.rejected += 1;
                warn!(
                    payload = %malformed.payload,
                    reason = %malformed.reason,
                    "Skipping malformed scan"
                );
                return Ok(());
            }
        };
        let payload = codec::encode(&event);

        if !self.buffer.is_empty() {
            self.push_buffer(payload);
            return Ok(());
        }

        match self.client.publish(&payload).await {
            Ok(()) => {
                self.stats.published += 1;
                debug!(event = %event, "Published scan");
                Ok(())
            }
            Err(e @ PublishError::Unavailable { .. }) => {
                warn!(event = %event, error = %e, "Broker unavailable; buffering scan");
                self.push_buffer(payload);
                self.schedule_retry();
                Ok(())
            }
            Err(e) => {
                self.push_buffer(payload);
                Err(e)
            }
        }
    }

    /// Publish buffered events in order until one fails
    async fn flush_buffer(&mut self) -> std::result::Result<(), PublishError> {
        let mut flushed = 0usize;
        while let Some(payload) = self.buffer.front() {
            match self.client.publish(payload).await {
                Ok(()) => {
                    self.buffer.pop_front();
                    self.stats.published += 1;
                    flushed += 1;
                }
                Err(e @ PublishError::Unavailable { .. }) => {
                    debug!(error = %e, buffered = self.buffer.len(), "Broker still unavailable");
                    self.retry_delay = self
                        .retry_delay
                        .saturating_mul(2)
                        .min(self.config.publish_retry_max());
                    self.schedule_retry();
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        if flushed > 0 {
            info!(flushed, "Broker available again; buffered scans published");
        }
        self.retry_delay = self.config.publish_retry_initial();
        self.retry_at = None;
        Ok(())
    }

    fn schedule_retry(&mut self) {
        let now = Instant::now();
        self.retry_at = Some(now.checked_add(self.retry_delay).unwrap_or(now + FAR_FUTURE));
    }

    fn push_buffer(&mut self, payload: Vec<u8>) {
        if self.buffer.len() >= self.config.buffer_capacity {
            if let Some(oldest) = self.buffer.pop_front() {
                self.stats.dropped += 1;
                log_operator_alert(
                    COMPONENT,
                    "buffer_overflow",
                    Some(&String::from_utf8_lossy(&oldest)),
                    &format!(
                        "publish buffer full ({} events); oldest scan dropped",
                        self.config.buffer_capacity
                    ),
                );
            }
        }
        self.buffer.push_back(payload);
    }

    fn abandon_buffer(&mut self, condition: &str) {
        self.stats.buffered = self.buffer.len() as u64;
        for payload in self.buffer.drain(..) {
            self.stats.dropped += 1;
            log_operator_alert(
                COMPONENT,
                condition,
                Some(&String::from_utf8_lossy(&payload)),
                "scan was never published",
            );
        }
    }
}
