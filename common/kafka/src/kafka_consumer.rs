use std::sync::Arc;
use std::time::Duration;

use rdkafka::{
    consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::KafkaError,
    ClientConfig, ClientContext, Message, TopicPartitionList,
};
use tracing::{info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};

/// A borrowed Kafka record, decoupled from rdkafka's lifetime-bound `BorrowedMessage`
/// so callers can stash it in a position tracker and inspect it after the next `poll`.
#[derive(Debug, Clone)]
pub struct OwnedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

struct RebalanceLogger;

impl ClientContext for RebalanceLogger {}

impl ConsumerContext for RebalanceLogger {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        info!("kafka rebalance starting: {:?}", rebalance);
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        info!("kafka rebalance complete: {:?}", rebalance);
    }
}

/// A consumer that never auto-commits: offsets are only ever advanced by an explicit
/// call to `commit`, driven by a caller-owned position tracker rather than rdkafka's
/// own offset store. Subscribes by topic regex so newly created topics matching the
/// pattern are picked up without a restart.
pub struct TrackedConsumer {
    inner: StreamConsumer<RebalanceLogger>,
}

impl TrackedConsumer {
    pub fn new(
        kafka_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        topic_pattern: &str,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &kafka_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            // Regex-subscribed topics are only picked up on metadata refresh;
            // librdkafka's default (minutes) is too slow to notice newly
            // created log topics promptly.
            .set("topic.metadata.refresh.interval.ms", "5000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        if kafka_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let consumer: StreamConsumer<RebalanceLogger> =
            client_config.create_with_context(RebalanceLogger)?;
        // `^pattern` is rdkafka/librdkafka's convention for a regex-subscribed topic set.
        consumer.subscribe(&[&format!("^{topic_pattern}")])?;

        Ok(Self { inner: consumer })
    }

    /// Blocks until a message is available or `timeout` elapses.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Result<OwnedRecord, KafkaError>> {
        match tokio::time::timeout(timeout, self.inner.recv()).await {
            Ok(Ok(msg)) => Some(Ok(OwnedRecord {
                topic: msg.topic().to_owned(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(|k| k.to_vec()),
                payload: msg.payload().map(|p| p.to_vec()),
            })),
            Ok(Err(e)) => Some(Err(e)),
            Err(_) => None,
        }
    }

    /// Drains whatever is immediately available, non-blocking, up to `max_records`.
    pub async fn poll_batch(&self, max_records: usize) -> Vec<Result<OwnedRecord, KafkaError>> {
        let mut out = Vec::new();
        while out.len() < max_records {
            match tokio::time::timeout(Duration::from_millis(0), self.inner.recv()).await {
                Ok(res) => out.push(res.map(|msg| OwnedRecord {
                    topic: msg.topic().to_owned(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    key: msg.key().map(|k| k.to_vec()),
                    payload: msg.payload().map(|p| p.to_vec()),
                })),
                Err(_) => break,
            }
        }
        out
    }

    /// Fetches the broker's (low, high) watermark for a partition. Blocks the
    /// calling thread on a metadata round-trip; callers on an async executor
    /// should run this via `spawn_blocking`.
    pub fn fetch_watermarks(
        &self,
        topic: &str,
        partition: i32,
        timeout: Duration,
    ) -> Result<(i64, i64), KafkaError> {
        self.inner.fetch_watermarks(topic, partition, timeout)
    }

    /// Commits the given per-partition watermarks (offset = next offset to read).
    pub fn commit(&self, watermarks: &[(String, i32, i64)]) -> Result<(), KafkaError> {
        if watermarks.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for (topic, partition, offset) in watermarks {
            tpl.add_partition_offset(
                topic,
                *partition,
                rdkafka::Offset::Offset(offset + 1),
            )?;
        }
        match self.inner.commit(&tpl, rdkafka::consumer::CommitMode::Async) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("kafka commit failed, will retry next iteration: {:?}", e);
                Err(e)
            }
        }
    }
}

pub type SharedTrackedConsumer = Arc<TrackedConsumer>;
