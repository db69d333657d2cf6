//! Destinations for messages that can't be ingested.
//!
//! Every rejected message is handed over together with its coordinates and
//! the reason, before the offsets covering it are committed.
pub mod kafka;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::warn;

use crate::consumer::RawMessage;
use crate::decoder::Rejection;
use crate::retry::RetryDisposition;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Reason {
    /// payload failed decoding or schema validation
    Validation { rejection: Rejection },
    /// the store refused the row
    Store { error: String },
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Validation { rejection } => write!(f, "{rejection}"),
            Reason::Store { error } => write!(f, "store rejected row: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    #[serde(serialize_with = "lossy_utf8")]
    pub payload: Vec<u8>,
    pub reason: Reason,
    pub rejected_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(topic: &str, msg: &RawMessage, reason: Reason) -> Self {
        DeadLetter {
            topic: topic.to_owned(),
            partition: msg.partition,
            offset: msg.offset,
            timestamp: msg.timestamp,
            payload: msg.value.clone(),
            reason,
            rejected_at: Utc::now(),
        }
    }
}

fn lossy_utf8<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("writing dead letter: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding dead letter: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("producing dead letter: {0}")]
    Kafka(String),
}

impl DeadLetterError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            DeadLetterError::Encode(_) => RetryDisposition::Stop,
            DeadLetterError::Io(_) | DeadLetterError::Kafka(_) => RetryDisposition::Retry,
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durably stores the letter; returning Ok means it may be committed past
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// Keeps rejected messages in the log only, under the `dead_letter` target.
/// Emitted at warn so the default `info` filter keeps them.
pub struct LogDeadLetter;

#[async_trait]
impl DeadLetterSink for LogDeadLetter {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        warn!(
            target: "dead_letter",
            topic = %letter.topic,
            partition = letter.partition,
            offset = letter.offset,
            reason = %letter.reason,
            payload = %String::from_utf8_lossy(&letter.payload),
            "dead letter"
        );
        Ok(())
    }
}

/// Appends one JSON document per line
pub struct FileDeadLetter {
    file: tokio::sync::Mutex<File>,
}

impl FileDeadLetter {
    pub fn open(path: &Path) -> Result<Self, DeadLetterError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(FileDeadLetter {
            file: tokio::sync::Mutex::new(File::from_std(file)),
        })
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetter {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(letter)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Collects letters in memory; clones share the same list
#[derive(Clone, Default)]
pub struct MemoryDeadLetter {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl MemoryDeadLetter {
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetter {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn letter() -> DeadLetter {
        let msg = RawMessage {
            partition: 2,
            offset: 17,
            key: None,
            value: b"{\"postcode\":\"abc\"}".to_vec(),
            timestamp: 1_700_000_000_000,
        };
        DeadLetter::new(
            "names_topic",
            &msg,
            Reason::Validation {
                rejection: crate::decoder::validate(&msg.value).unwrap_err(),
            },
        )
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rejects.jsonl");
        let sink = FileDeadLetter::open(&path).unwrap();
        sink.send(&letter()).await.unwrap();
        sink.send(&letter()).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["topic"], "names_topic");
        assert_eq!(v["partition"], 2);
        assert_eq!(v["offset"], 17);
        assert_eq!(v["payload"], "{\"postcode\":\"abc\"}");
        assert_eq!(v["reason"]["stage"], "validation");
        assert_eq!(v["reason"]["rejection"]["kind"], "schema_violation");
        assert_eq!(v["reason"]["rejection"]["field"], "full_name");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn log_sink_is_visible_at_default_level() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        LogDeadLetter.send(&letter()).await.unwrap();

        let out = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("WARN"), "{out}");
        assert!(out.contains("dead_letter"), "{out}");
        assert!(out.contains("topic=names_topic"), "{out}");
        assert!(out.contains("partition=2"), "{out}");
        assert!(out.contains("offset=17"), "{out}");
        assert!(out.contains("{\"postcode\":\"abc\"}"), "{out}");
        assert!(out.contains("schema violation in field 'full_name'"), "{out}");
    }

    #[test]
    fn reason_is_readable() {
        let reason = Reason::Store {
            error: "duplicate key".into(),
        };
        assert_eq!(reason.to_string(), "store rejected row: duplicate key");
    }
}
