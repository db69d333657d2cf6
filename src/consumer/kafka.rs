//! Kafka consumer group backed by rdkafka
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    Message, Offset, TopicPartitionList,
};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::{Batch, Checkpoint, ConsumerError, QueueConsumer, RawMessage};
use crate::settings;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaConsumer {
    /// Creates the consumer and subscribes to the topic.
    /// Offsets are never committed automatically; the start position only
    /// applies to partitions the group has no committed offset for.
    pub fn new(cfg: &settings::Kafka) -> Result<Self, ConsumerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", cfg.broker_list().join(","))
            .set("group.id", cfg.group())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", cfg.starting_offsets.as_str())
            .create()
            .map_err(classify)?;
        consumer.subscribe(&[cfg.topic.as_str()]).map_err(classify)?;
        Ok(KafkaConsumer {
            consumer,
            topic: cfg.topic.clone(),
        })
    }
}

/// Authorization and fatal client errors need an operator, everything else
/// is treated as a connectivity hiccup.
fn classify(e: KafkaError) -> ConsumerError {
    match e.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::Fatal
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::SaslAuthenticationFailed,
        ) => ConsumerError::Fatal(e.to_string()),
        _ if matches!(e, KafkaError::ClientCreation(_) | KafkaError::Subscription(_)) => {
            ConsumerError::Fatal(e.to_string())
        }
        _ => ConsumerError::Connection(e.to_string()),
    }
}

#[async_trait]
impl QueueConsumer for KafkaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    /// Fetches topic metadata to make sure brokers are reachable
    async fn connect(&self) -> Result<(), ConsumerError> {
        let metadata = tokio::task::block_in_place(|| {
            self.consumer
                .fetch_metadata(Some(&self.topic), METADATA_TIMEOUT)
                .map_err(classify)
        })?;
        match metadata.topics().iter().find(|t| t.name() == self.topic) {
            Some(t) if t.error().is_none() => {
                debug!(
                    topic = %self.topic,
                    partitions = t.partitions().len(),
                    "topic metadata fetched"
                );
                Ok(())
            }
            _ => Err(ConsumerError::Connection(format!(
                "topic {} not available",
                self.topic
            ))),
        }
    }

    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Batch, ConsumerError> {
        let deadline = Instant::now() + timeout;
        let mut batch = Batch::default();
        while batch.len() < max_records {
            match timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    if batch.is_empty() {
                        return Err(classify(e));
                    }
                    warn!("error receiving message, returning partial batch: {e}");
                    break;
                }
                Ok(Ok(msg)) => batch.push(RawMessage {
                    partition: msg.partition(),
                    offset: msg.offset(),
                    key: msg.key().map(<[u8]>::to_vec),
                    value: msg.payload().unwrap_or_default().to_vec(),
                    timestamp: msg.timestamp().to_millis().unwrap_or(-1),
                }),
            }
        }
        Ok(batch)
    }

    async fn commit(&self, offsets: &Checkpoint) -> Result<(), ConsumerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for (&partition, &offset) in offsets {
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset))
                .map_err(classify)?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(classify)
    }
}
