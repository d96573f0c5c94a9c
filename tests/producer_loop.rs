//! Producer loop behaviour under broker outages, overflow and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{wait_until, within};
use scan_relay::config::ProducerConfig;
use scan_relay::messaging::{InMemoryQueueClient, QueueClient};
use scan_relay::producer::{
    AcquisitionSource, BlockingSource, ProducerLoop, SourceError, SourcePoll,
};

const WAIT: Duration = Duration::from_secs(5);

/// Scans pushed by the test through a channel; closing the sender closes the source
struct ChannelSource(mpsc::UnboundedReceiver<String>);

#[async_trait]
impl AcquisitionSource for ChannelSource {
    async fn next_scan(&mut self) -> Result<SourcePoll, SourceError> {
        Ok(match self.0.recv().await {
            Some(scan) => SourcePoll::Scan(scan),
            None => SourcePoll::Closed,
        })
    }
}

fn config(buffer_capacity: usize) -> ProducerConfig {
    ProducerConfig {
        poll_interval_ms: 5,
        publish_retry_initial_ms: 10,
        publish_retry_max_ms: 40,
        buffer_capacity,
    }
}

async fn drain_bodies(client: &InMemoryQueueClient) -> Vec<String> {
    let mut bodies = Vec::new();
    while client.ready_len() > 0 {
        let delivery = client.next_delivery().await.unwrap().unwrap();
        bodies.push(delivery.payload_lossy());
    }
    bodies
}

#[tokio::test]
async fn test_outage_buffers_and_preserves_order() {
    let client = Arc::new(InMemoryQueueClient::new("qrscan"));
    client.set_available(false);
    let (tx, rx) = mpsc::unbounded_channel();

    let producer = ProducerLoop::new(client.clone(), ChannelSource(rx), config(16));
    let task = tokio::spawn(producer.run(CancellationToken::new()));

    for scan in ["OP7,S500", "not a scan", "OP8,S501", "OP9,S502"] {
        tx.send(scan.to_string()).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(client.ready_len(), 0);

    client.set_available(true);
    assert!(wait_until(WAIT, || client.ready_len() == 3).await);
    drop(tx);

    let stats = within(WAIT, task).await.unwrap().unwrap();
    assert_eq!(stats.scanned, 4);
    assert_eq!(stats.published, 3);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.dropped, 0);
    assert_eq!(
        drain_bodies(&client).await,
        vec!["OP7,S500", "OP8,S501", "OP9,S502"]
    );
}

#[tokio::test]
async fn test_overflow_and_shutdown_during_outage_report_losses() {
    let client = Arc::new(InMemoryQueueClient::new("qrscan"));
    client.set_available(false);
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let producer = ProducerLoop::new(client.clone(), ChannelSource(rx), config(2));
    let task = tokio::spawn(producer.run(cancel.clone()));

    for scan in ["A,1", "B,2", "C,3"] {
        tx.send(scan.to_string()).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let stats = within(WAIT, task).await.unwrap().unwrap();
    assert_eq!(stats.published, 0);
    assert_eq!(stats.buffered, 2);
    // One overflow drop plus two events abandoned at shutdown
    assert_eq!(stats.dropped, 3);
    assert_eq!(client.total_len(), 0);
}

#[tokio::test]
async fn test_shutdown_flushes_buffer_when_broker_is_back() {
    let client = Arc::new(InMemoryQueueClient::new("qrscan"));
    client.set_available(false);
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let mut producer_config = config(8);
    producer_config.publish_retry_initial_ms = 10_000;
    producer_config.publish_retry_max_ms = 10_000;
    let producer = ProducerLoop::new(client.clone(), ChannelSource(rx), producer_config);
    let task = tokio::spawn(producer.run(cancel.clone()));

    tx.send("OP7,S500".to_string()).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    client.set_available(true);
    cancel.cancel();

    let stats = within(WAIT, task).await.unwrap().unwrap();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.dropped, 0);
    assert_eq!(drain_bodies(&client).await, vec!["OP7,S500"]);
}

#[tokio::test]
async fn test_blocking_source_polls_until_closed() {
    let client = Arc::new(InMemoryQueueClient::new("qrscan"));
    let mut script = vec![
        Ok(Some("OP7,S500".to_string())),
        Ok(None),
        Ok(Some("OP8,S501".to_string())),
    ]
    .into_iter();
    let source = BlockingSource::new(move || {
        script
            .next()
            .unwrap_or_else(|| Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)))
    });

    let producer = ProducerLoop::new(client.clone(), source, config(4));
    let stats = within(WAIT, producer.run(CancellationToken::new()))
        .await
        .unwrap();

    assert_eq!(stats.published, 2);
    assert_eq!(drain_bodies(&client).await, vec!["OP7,S500", "OP8,S501"]);
}
