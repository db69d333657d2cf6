//! In-process partitioned log.
//!
//! Behaves like a single-topic Kafka consumer group: offsets are per partition,
//! commits survive consumers, and a fresh consumer resumes from the committed
//! position (or from [StartingOffsets] when nothing is committed yet).
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use super::{Batch, Checkpoint, ConsumerError, QueueConsumer, RawMessage, StartingOffsets};

#[derive(Default)]
struct LogState {
    partitions: Vec<Vec<RawMessage>>,
    committed: Checkpoint,
    commits: usize,
    poll_failures: usize,
    commit_failures: usize,
}

/// Shared handle to the log; clones see the same data
#[derive(Clone)]
pub struct MemoryLog {
    topic: String,
    state: Arc<Mutex<LogState>>,
    appended: Arc<Notify>,
}

impl MemoryLog {
    pub fn new(topic: &str, partitions: usize) -> Self {
        MemoryLog {
            topic: topic.to_owned(),
            state: Arc::new(Mutex::new(LogState {
                partitions: vec![Vec::new(); partitions.max(1)],
                ..Default::default()
            })),
            appended: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        // a panicking holder cannot leave the log half-updated
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a message and returns its offset.
    /// Partitions outside the log wrap around, like a modulo partitioner.
    pub fn append(&self, partition: i32, value: impl Into<Vec<u8>>) -> i64 {
        let offset = {
            let mut state = self.lock();
            let partition = partition.rem_euclid(state.partitions.len() as i32);
            let log = &mut state.partitions[partition as usize];
            let offset = log.len() as i64;
            log.push(RawMessage {
                partition,
                offset,
                key: None,
                value: value.into(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
            offset
        };
        self.appended.notify_waiters();
        offset
    }

    pub fn committed(&self) -> Checkpoint {
        self.lock().committed.clone()
    }

    /// Number of commit calls received so far
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Makes the next `n` polls fail with a connection error
    pub fn fail_next_polls(&self, n: usize) {
        self.lock().poll_failures = n;
    }

    /// Makes the next `n` commits fail with a connection error
    pub fn fail_next_commits(&self, n: usize) {
        self.lock().commit_failures = n;
    }

    /// Creates a consumer, resolving start positions from the committed
    /// offsets or, for partitions without one, from `start`.
    pub fn consumer(&self, start: StartingOffsets) -> MemoryConsumer {
        let positions = {
            let state = self.lock();
            state
                .partitions
                .iter()
                .enumerate()
                .map(|(p, log)| {
                    let p = p as i32;
                    let pos = match (state.committed.get(&p), start) {
                        (Some(&committed), _) => committed,
                        (None, StartingOffsets::Earliest) => 0,
                        (None, StartingOffsets::Latest) => log.len() as i64,
                    };
                    (p, pos)
                })
                .collect()
        };
        MemoryConsumer {
            log: self.clone(),
            positions: Mutex::new(positions),
        }
    }
}

pub struct MemoryConsumer {
    log: MemoryLog,
    positions: Mutex<Checkpoint>,
}

impl MemoryConsumer {
    fn drain_into(&self, batch: &mut Batch, max_records: usize) -> Result<(), ConsumerError> {
        let mut state = self.log.lock();
        if state.poll_failures > 0 {
            state.poll_failures -= 1;
            return Err(ConsumerError::Connection(String::from(
                "memory log unavailable",
            )));
        }
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        for (p, log) in state.partitions.iter().enumerate() {
            let pos = positions.entry(p as i32).or_insert(0);
            while batch.len() < max_records {
                match log.get(*pos as usize) {
                    Some(msg) => {
                        batch.push(msg.clone());
                        *pos += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    fn topic(&self) -> &str {
        &self.log.topic
    }

    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Batch, ConsumerError> {
        let deadline = Instant::now() + timeout;
        let appended = self.log.appended.clone();
        let mut batch = Batch::default();
        loop {
            let notified = appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Err(e) = self.drain_into(&mut batch, max_records) {
                if batch.is_empty() {
                    return Err(e);
                }
                break;
            }
            if batch.len() >= max_records {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => break,
            }
        }
        Ok(batch)
    }

    async fn commit(&self, offsets: &Checkpoint) -> Result<(), ConsumerError> {
        let mut state = self.log.lock();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(ConsumerError::Connection(String::from(
                "memory log unavailable",
            )));
        }
        state.commits += 1;
        for (&p, &offset) in offsets {
            let committed = state.committed.entry(p).or_insert(offset);
            *committed = (*committed).max(offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[tokio::test(start_paused = true)]
    async fn empty_poll_times_out_without_error() {
        let log = MemoryLog::new("t", 2);
        let c = log.consumer(StartingOffsets::Earliest);
        let batch = c.poll(10, TIMEOUT).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn returns_partial_batch_on_timeout() {
        let log = MemoryLog::new("t", 2);
        log.append(0, "a");
        log.append(1, "b");
        let c = log.consumer(StartingOffsets::Earliest);
        let batch = c.poll(10, TIMEOUT).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn caps_batch_at_max_records() {
        let log = MemoryLog::new("t", 1);
        for i in 0..5 {
            log.append(0, format!("{i}"));
        }
        let c = log.consumer(StartingOffsets::Earliest);
        let first = c.poll(3, TIMEOUT).await.unwrap();
        assert_eq!(first.checkpoint(), Checkpoint::from([(0, 3)]));
        let second = c.poll(3, TIMEOUT).await.unwrap();
        assert_eq!(second.checkpoint(), Checkpoint::from([(0, 5)]));
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_up_on_append() {
        let log = MemoryLog::new("t", 1);
        let c = log.consumer(StartingOffsets::Earliest);
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(0, "late");
        });
        let batch = c.poll(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.messages()[0].value, b"late");
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let log = MemoryLog::new("t", 1);
        let c = log.consumer(StartingOffsets::Earliest);
        let offsets = Checkpoint::from([(0, 4)]);
        c.commit(&offsets).await.unwrap();
        c.commit(&offsets).await.unwrap();
        assert_eq!(log.committed(), offsets);
        c.commit(&Checkpoint::from([(0, 2)])).await.unwrap();
        assert_eq!(log.committed(), offsets);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_after_committed_offset() {
        let log = MemoryLog::new("t", 1);
        for i in 0..4 {
            log.append(0, format!("{i}"));
        }
        let c = log.consumer(StartingOffsets::Earliest);
        let batch = c.poll(2, TIMEOUT).await.unwrap();
        c.commit(&batch.checkpoint()).await.unwrap();
        // read but never committed
        c.poll(1, TIMEOUT).await.unwrap();
        drop(c);

        let restarted = log.consumer(StartingOffsets::Latest);
        let batch = restarted.poll(10, TIMEOUT).await.unwrap();
        let offsets: Vec<i64> = batch.messages().iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_skips_existing_messages() {
        let log = MemoryLog::new("t", 1);
        log.append(0, "old");
        let c = log.consumer(StartingOffsets::Latest);
        log.append(0, "new");
        let batch = c.poll(10, TIMEOUT).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.messages()[0].value, b"new");
    }

    #[tokio::test]
    async fn injected_poll_failures() {
        let log = MemoryLog::new("t", 1);
        log.fail_next_polls(1);
        let c = log.consumer(StartingOffsets::Earliest);
        assert!(matches!(
            c.poll(1, TIMEOUT).await,
            Err(ConsumerError::Connection(_))
        ));
        assert!(c.poll(1, TIMEOUT).await.is_ok());
    }
}
