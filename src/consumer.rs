//! Consumption of a partitioned, offset-addressable log
pub mod kafka;
pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryDisposition;

/// Committed position per partition: the offset of the _next_ message to read,
/// following the Kafka commit convention.
pub type Checkpoint = BTreeMap<i32, i64>;

/// Message as read from the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    /// milliseconds since epoch, -1 if the broker didn't provide one
    pub timestamp: i64,
}

/// Inclusive range of offsets read from one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRange {
    pub first: i64,
    pub last: i64,
}

/// Messages returned by one poll, in arrival order
#[derive(Debug, Default)]
pub struct Batch {
    messages: Vec<RawMessage>,
    ranges: BTreeMap<i32, OffsetRange>,
}

impl Batch {
    pub fn push(&mut self, msg: RawMessage) {
        self.ranges
            .entry(msg.partition)
            .and_modify(|r| {
                r.first = r.first.min(msg.offset);
                r.last = r.last.max(msg.offset);
            })
            .or_insert(OffsetRange {
                first: msg.offset,
                last: msg.offset,
            });
        self.messages.push(msg);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[RawMessage] {
        &self.messages
    }

    pub fn ranges(&self) -> &BTreeMap<i32, OffsetRange> {
        &self.ranges
    }

    /// Offsets to commit once every message of this batch is handled
    pub fn checkpoint(&self) -> Checkpoint {
        self.ranges
            .iter()
            .map(|(&p, r)| (p, r.last + 1))
            .collect()
    }
}

impl FromIterator<RawMessage> for Batch {
    fn from_iter<I: IntoIterator<Item = RawMessage>>(iter: I) -> Self {
        let mut batch = Batch::default();
        for msg in iter {
            batch.push(msg);
        }
        batch
    }
}

/// Where to start reading partitions that have no committed offset yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartingOffsets {
    #[default]
    Earliest,
    Latest,
}

impl StartingOffsets {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartingOffsets::Earliest => "earliest",
            StartingOffsets::Latest => "latest",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("queue error: {0}")]
    Fatal(String),
}

impl ConsumerError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ConsumerError::Connection(_) => RetryDisposition::Retry,
            ConsumerError::Fatal(_) => RetryDisposition::Stop,
        }
    }
}

/// Reads batches from a partitioned log and records consumed positions.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Topic the consumer is subscribed to
    fn topic(&self) -> &str;

    /// Checks that the log is reachable
    async fn connect(&self) -> Result<(), ConsumerError> {
        Ok(())
    }

    /// Waits up to `timeout` collecting at most `max_records` messages.
    /// An empty batch on timeout is not an error.
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Batch, ConsumerError>;

    /// Durably records consumed positions. Committing the same offsets again
    /// is a no-op. Only call once the matching messages are written downstream.
    async fn commit(&self, offsets: &Checkpoint) -> Result<(), ConsumerError>;
}
