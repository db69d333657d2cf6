//! In-process table keyed by record id, with fault injection
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{SinkError, SinkWriter};
use crate::record::{KeyedRecord, Record};

type Predicate = Box<dyn Fn(&Record) -> bool + Send>;

#[derive(Default)]
struct TableState {
    rows: Vec<KeyedRecord>,
    ids: HashSet<Uuid>,
    attempts: Vec<Instant>,
    connect_failures: usize,
    insert_failures: usize,
    lost_acks: usize,
    dropped: bool,
    reject: Option<Predicate>,
}

/// Shared handle; clones write to the same table
#[derive(Clone, Default)]
pub struct MemoryTable {
    state: Arc<Mutex<TableState>>,
}

impl MemoryTable {
    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stored rows in insertion order
    pub fn rows(&self) -> Vec<KeyedRecord> {
        self.lock().rows.clone()
    }

    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    /// Start time of every insert call
    pub fn attempts(&self) -> Vec<Instant> {
        self.lock().attempts.clone()
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.lock().connect_failures = n;
    }

    /// The next `n` inserts fail before touching the table
    pub fn fail_next_inserts(&self, n: usize) {
        self.lock().insert_failures = n;
    }

    /// The next `n` inserts are applied but reported as failed
    pub fn lose_next_acks(&self, n: usize) {
        self.lock().lost_acks = n;
    }

    /// Every later connect and insert fails as if the table didn't exist
    pub fn drop_table(&self) {
        self.lock().dropped = true;
    }

    /// Inserts containing a matching record are refused as a whole,
    /// like a constraint violation
    pub fn reject_where(&self, pred: impl Fn(&Record) -> bool + Send + 'static) {
        self.lock().reject = Some(Box::new(pred));
    }
}

#[async_trait]
impl SinkWriter for MemoryTable {
    async fn connect(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(SinkError::Transient(String::from("connection refused")));
        }
        if state.dropped {
            return Err(missing_table());
        }
        Ok(())
    }

    async fn insert(&self, records: &[KeyedRecord]) -> Result<u64, SinkError> {
        let mut state = self.lock();
        state.attempts.push(Instant::now());
        if state.insert_failures > 0 {
            state.insert_failures -= 1;
            return Err(SinkError::Transient(String::from("connection reset")));
        }
        if state.dropped {
            return Err(missing_table());
        }
        if let Some(reject) = &state.reject {
            if records.iter().any(|r| reject(&r.record)) {
                return Err(SinkError::Rejected {
                    records: records.to_vec(),
                    reason: String::from("check constraint violated"),
                });
            }
        }
        let mut inserted = 0;
        for r in records {
            if state.ids.insert(r.id) {
                state.rows.push(r.clone());
                inserted += 1;
            }
        }
        if state.lost_acks > 0 {
            state.lost_acks -= 1;
            return Err(SinkError::Transient(String::from(
                "connection lost before commit was acknowledged",
            )));
        }
        Ok(inserted)
    }
}

fn missing_table() -> SinkError {
    SinkError::Fatal(String::from("relation does not exist"))
}
