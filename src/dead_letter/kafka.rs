//! Dead-letter topic: the original payload is produced unchanged,
//! coordinates and reason travel in headers.
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};

use super::{DeadLetter, DeadLetterError, DeadLetterSink};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KafkaDeadLetter {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetter {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, DeadLetterError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", DELIVERY_TIMEOUT.as_millis().to_string())
            .create()
            .map_err(|e| DeadLetterError::Kafka(e.to_string()))?;
        Ok(KafkaDeadLetter {
            producer,
            topic: topic.to_owned(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetter {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let partition = letter.partition.to_string();
        let offset = letter.offset.to_string();
        let reason = letter.reason.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "dlq.topic",
                value: Some(letter.topic.as_str()),
            })
            .insert(Header {
                key: "dlq.partition",
                value: Some(partition.as_str()),
            })
            .insert(Header {
                key: "dlq.offset",
                value: Some(offset.as_str()),
            })
            .insert(Header {
                key: "dlq.reason",
                value: Some(reason.as_str()),
            });
        let record = FutureRecord::<(), [u8]>::to(&self.topic)
            .payload(letter.payload.as_slice())
            .headers(headers);
        self.producer
            .send(record, DELIVERY_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| DeadLetterError::Kafka(e.to_string()))
    }
}
