//! Writing validated records to the target table
pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::KeyedRecord;
use crate::retry::{RetryDisposition, RetryError, RetryPolicy};

#[derive(Debug, Error)]
pub enum SinkError {
    /// Connectivity trouble, the same write may succeed later
    #[error("transient store error: {0}")]
    Transient(String),
    /// The target table can't take any row (missing, wrong shape, no privilege)
    #[error("store misconfigured: {0}")]
    Fatal(String),
    /// The store refused the data; retrying the same rows won't help
    #[error("store rejected {} records: {reason}", records.len())]
    Rejected {
        records: Vec<KeyedRecord>,
        reason: String,
    },
}

impl SinkError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SinkError::Transient(_) => RetryDisposition::Retry,
            SinkError::Fatal(_) | SinkError::Rejected { .. } => RetryDisposition::Stop,
        }
    }
}

/// Single-attempt, all-or-nothing writer.
///
/// `insert` must be atomic: either every record of the call becomes visible or
/// none does. Records whose id is already stored are skipped, which makes
/// repeating a call after an unacknowledged success harmless.
#[async_trait]
pub trait SinkWriter: Send + Sync {
    /// Establishes the connection and prepares the target table
    async fn connect(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Returns the number of rows that were not present before
    async fn insert(&self, records: &[KeyedRecord]) -> Result<u64, SinkError>;
}

/// [SinkWriter] with bounded attempts, per-attempt timeout and backoff
pub struct Sink<W> {
    writer: W,
    policy: RetryPolicy,
    timeout: Duration,
}

impl<W: SinkWriter> Sink<W> {
    pub fn new(writer: W, policy: RetryPolicy, timeout: Duration) -> Self {
        Sink {
            writer,
            policy,
            timeout,
        }
    }

    pub async fn connect(&self) -> Result<(), SinkError> {
        let writer = &self.writer;
        self.policy
            .run("connecting to store", move || writer.connect(), SinkError::disposition)
            .await
            .map_err(RetryError::into_inner)
    }

    /// Writes the batch, retrying transient failures.
    /// A returned [SinkError::Transient] means the attempts are exhausted.
    pub async fn write(&self, records: &[KeyedRecord]) -> Result<u64, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }
        let writer = &self.writer;
        let timeout = self.timeout;
        self.policy
            .run(
                "batch insert",
                move || async move {
                    match tokio::time::timeout(timeout, writer.insert(records)).await {
                        Ok(res) => res,
                        Err(_) => Err(SinkError::Transient(format!(
                            "insert timed out after {timeout:?}"
                        ))),
                    }
                },
                SinkError::disposition,
            )
            .await
            .map_err(RetryError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryTable;
    use super::*;
    use crate::record::{record_id, Record};

    fn keyed(offset: i64) -> KeyedRecord {
        KeyedRecord {
            id: record_id("t", 0, offset),
            partition: 0,
            offset,
            record: Record {
                full_name: format!("user {offset}"),
                gender: "F".into(),
                location: "X".into(),
                city: "Y".into(),
                country: "Z".into(),
                postcode: 1000 + offset as i32,
                latitude: 1.5,
                longitude: 2.5,
                email: "u@x.com".into(),
            },
        }
    }

    fn sink(table: &MemoryTable, retries: usize) -> Sink<MemoryTable> {
        Sink::new(
            table.clone(),
            RetryPolicy::new(retries, Duration::from_millis(100), Duration::from_secs(1)),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_with_growing_backoff() {
        let table = MemoryTable::default();
        table.fail_next_inserts(2);
        let written = sink(&table, 5).write(&[keyed(0), keyed(1)]).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(table.row_count(), 2);

        let attempts = table.attempts();
        assert_eq!(attempts.len(), 3);
        let first_gap = attempts[1] - attempts[0];
        let second_gap = attempts[2] - attempts[1];
        assert_eq!(first_gap, Duration::from_millis(100));
        assert_eq!(second_gap, Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_acknowledgement_does_not_duplicate() {
        let table = MemoryTable::default();
        table.lose_next_acks(1);
        let written = sink(&table, 3).write(&[keyed(0), keyed(1)]).await.unwrap();
        // the second attempt finds both rows already present
        assert_eq!(written, 0);
        assert_eq!(table.row_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retries() {
        let table = MemoryTable::default();
        table.fail_next_inserts(10);
        let err = sink(&table, 2).write(&[keyed(0)]).await.unwrap_err();
        assert!(matches!(err, SinkError::Transient(_)));
        assert_eq!(table.attempts().len(), 3);
        assert_eq!(table.row_count(), 0);
    }

    #[tokio::test]
    async fn rejection_is_not_retried_and_atomic() {
        let table = MemoryTable::default();
        table.reject_where(|r| r.postcode == 1001);
        let err = sink(&table, 5)
            .write(&[keyed(0), keyed(1), keyed(2)])
            .await
            .unwrap_err();
        match err {
            SinkError::Rejected { records, .. } => assert_eq!(records.len(), 3),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(table.attempts().len(), 1);
        assert_eq!(table.row_count(), 0);
    }

    #[tokio::test]
    async fn missing_table_is_not_retried() {
        let table = MemoryTable::default();
        table.drop_table();
        let err = sink(&table, 5).write(&[keyed(0)]).await.unwrap_err();
        assert!(matches!(err, SinkError::Fatal(_)));
        assert_eq!(table.attempts().len(), 1);
    }

    #[tokio::test]
    async fn empty_write_is_a_no_op() {
        let table = MemoryTable::default();
        assert_eq!(sink(&table, 1).write(&[]).await.unwrap(), 0);
        assert!(table.attempts().is_empty());
    }
}
