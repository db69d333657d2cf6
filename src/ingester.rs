//! Drives messages from the queue into the table.
//!
//! One batch at a time goes through decode → transform → insert → commit.
//! Offsets are committed only after the insert (and the dead-letter hand-off
//! of rejected messages) succeeded, so a crash replays at most the batch in
//! flight and the idempotent insert absorbs the replay.
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::consumer::{kafka::KafkaConsumer, Batch, Checkpoint, ConsumerError, QueueConsumer};
use crate::dead_letter::{
    kafka::KafkaDeadLetter, DeadLetter, DeadLetterError, DeadLetterSink, FileDeadLetter,
    LogDeadLetter, Reason,
};
use crate::decoder::{Decoder, JsonDecoder};
use crate::record::{record_id, KeyedRecord};
use crate::retry::RetryPolicy;
use crate::settings::{self, Settings, SettingsError};
use crate::sink::{postgres::PostgresWriter, Sink, SinkError, SinkWriter};
use crate::transform::{Identity, Transform};

/// Lifecycle of an ingester.
/// `Init → Connecting → Streaming → (Draining | Failed)`, `Draining → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Connecting,
    Streaming,
    Draining,
    Failed,
    Stopped,
}

#[derive(Debug, Error)]
pub enum IngesterError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    #[error("ingester task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct Options {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub write_timeout: Duration,
    pub retry: RetryPolicy,
}

impl From<&Settings> for Options {
    fn from(s: &Settings) -> Self {
        Options {
            batch_size: s.kafka.batch_size,
            poll_timeout: s.kafka.poll_timeout(),
            write_timeout: s.postgres.write_timeout(),
            retry: s.retry.policy(),
        }
    }
}

/// Outcome of one processed batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub polled: usize,
    /// rows that were not in the table before
    pub written: u64,
    pub rejected: usize,
    pub offsets: Checkpoint,
}

pub struct Ingester<C, W> {
    consumer: C,
    sink: Sink<W>,
    decoder: Arc<dyn Decoder + Send + Sync>,
    transform: Arc<dyn Transform + Send + Sync>,
    dead_letters: Arc<dyn DeadLetterSink>,
    batch_size: usize,
    poll_timeout: Duration,
    retry: RetryPolicy,
    checkpoint: Checkpoint,
    state: watch::Sender<State>,
}

impl Ingester<KafkaConsumer, PostgresWriter> {
    /// Builds the Kafka → PostgreSQL ingester. Nothing is connected yet.
    pub fn from_settings(settings: &Settings) -> Result<Self, IngesterError> {
        let consumer = KafkaConsumer::new(&settings.kafka)?;
        let writer = PostgresWriter::new(
            settings.postgres.pg_config()?,
            &settings.postgres.table,
            settings.postgres.create_table,
        );
        let dead_letters: Arc<dyn DeadLetterSink> = match &settings.dead_letter {
            settings::DeadLetter::Log => Arc::new(LogDeadLetter),
            settings::DeadLetter::File { path } => Arc::new(FileDeadLetter::open(path)?),
            settings::DeadLetter::Kafka { topic } => Arc::new(KafkaDeadLetter::new(
                &settings.kafka.broker_list().join(","),
                topic,
            )?),
        };
        let decoder = JsonDecoder::new(settings.decoder.coerce_numeric_strings);
        Ok(Ingester::new(consumer, writer, dead_letters, Options::from(settings))
            .with_decoder(Arc::new(decoder)))
    }
}

impl<C: QueueConsumer, W: SinkWriter> Ingester<C, W> {
    pub fn new(
        consumer: C,
        writer: W,
        dead_letters: Arc<dyn DeadLetterSink>,
        options: Options,
    ) -> Self {
        let (state, _) = watch::channel(State::Init);
        Ingester {
            consumer,
            sink: Sink::new(writer, options.retry.clone(), options.write_timeout),
            decoder: Arc::new(JsonDecoder::default()),
            transform: Arc::new(Identity),
            dead_letters,
            batch_size: options.batch_size,
            poll_timeout: options.poll_timeout,
            retry: options.retry,
            checkpoint: Checkpoint::new(),
            state,
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder + Send + Sync>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform + Send + Sync>) -> Self {
        self.transform = transform;
        self
    }

    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Offsets committed by this ingester so far
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    fn set_state(&self, state: State) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "ingester state changed");
        }
    }

    /// Reaches the queue and the store, retrying with backoff
    pub async fn connect(&self) -> Result<(), IngesterError> {
        let consumer = &self.consumer;
        self.retry
            .run(
                "connecting to queue",
                move || consumer.connect(),
                ConsumerError::disposition,
            )
            .await
            .map_err(|e| IngesterError::from(e.into_inner()))?;
        self.sink.connect().await?;
        Ok(())
    }

    /// Polls one batch and processes it
    pub async fn step(&mut self) -> Result<BatchReport, IngesterError> {
        let batch = self.poll().await?;
        let report = self.process(&batch).await?;
        self.advance(&report.offsets);
        Ok(report)
    }

    /// Runs until `shutdown` is cancelled or an error can't be retried away.
    /// A batch that was polled is always finished and committed before stopping.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), IngesterError> {
        match self.run_until(&shutdown).await {
            Ok(()) => {
                self.set_state(State::Stopped);
                Ok(())
            }
            Err(e) => {
                self.set_state(State::Failed);
                error!("ingester failed, operator intervention required: {e}");
                Err(e)
            }
        }
    }

    async fn run_until(&mut self, shutdown: &CancellationToken) -> Result<(), IngesterError> {
        self.set_state(State::Connecting);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            res = self.connect() => res?,
        }
        self.set_state(State::Streaming);

        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                batch = self.poll() => batch?,
            };
            let report = {
                let processing = self.process(&batch);
                tokio::pin!(processing);
                tokio::select! {
                    biased;
                    res = &mut processing => res?,
                    _ = shutdown.cancelled() => {
                        self.set_state(State::Draining);
                        processing.await?
                    }
                }
            };
            self.advance(&report.offsets);
        }
        self.set_state(State::Draining);
        info!(checkpoint = ?self.checkpoint, "drained");
        Ok(())
    }

    async fn poll(&self) -> Result<Batch, IngesterError> {
        let consumer = &self.consumer;
        let (max_records, timeout) = (self.batch_size, self.poll_timeout);
        self.retry
            .run(
                "polling queue",
                move || consumer.poll(max_records, timeout),
                ConsumerError::disposition,
            )
            .await
            .map_err(|e| IngesterError::from(e.into_inner()))
    }

    async fn process(&self, batch: &Batch) -> Result<BatchReport, IngesterError> {
        if batch.is_empty() {
            return Ok(BatchReport {
                polled: 0,
                written: 0,
                rejected: 0,
                offsets: Checkpoint::new(),
            });
        }
        let topic = self.consumer.topic();
        let mut accepted = Vec::with_capacity(batch.len());
        let mut rejected = Vec::new();
        for msg in batch.messages() {
            match self.decoder.decode(&msg.value) {
                Ok(record) => accepted.push(KeyedRecord {
                    id: record_id(topic, msg.partition, msg.offset),
                    partition: msg.partition,
                    offset: msg.offset,
                    record: self.transform.apply(record),
                }),
                Err(rejection) => {
                    warn!(
                        partition = msg.partition,
                        offset = msg.offset,
                        field = rejection.field(),
                        "rejected message: {rejection}"
                    );
                    rejected.push(DeadLetter::new(topic, msg, Reason::Validation { rejection }));
                }
            }
        }

        let written = match self.sink.write(&accepted).await {
            Ok(n) => n,
            Err(SinkError::Rejected { reason, .. }) => {
                warn!(
                    rows = accepted.len(),
                    "store rejected batch, retrying rows one by one: {reason}"
                );
                self.write_each(batch, &accepted, &mut rejected).await?
            }
            Err(e) => return Err(e.into()),
        };

        for letter in &rejected {
            self.send_dead_letter(letter).await?;
        }

        let offsets = batch.checkpoint();
        self.commit(&offsets).await?;
        info!(
            decoder = %self.decoder.get_name(),
            polled = batch.len(),
            written,
            rejected = rejected.len(),
            offsets = ?offsets,
            "batch committed"
        );
        Ok(BatchReport {
            polled: batch.len(),
            written,
            rejected: rejected.len(),
            offsets,
        })
    }

    /// Isolates rows the store refuses; each row is its own transaction
    async fn write_each(
        &self,
        batch: &Batch,
        accepted: &[KeyedRecord],
        rejected: &mut Vec<DeadLetter>,
    ) -> Result<u64, IngesterError> {
        let topic = self.consumer.topic();
        let mut written = 0;
        for r in accepted {
            match self.sink.write(std::slice::from_ref(r)).await {
                Ok(n) => written += n,
                Err(SinkError::Rejected { reason, .. }) => {
                    warn!(
                        partition = r.partition,
                        offset = r.offset,
                        "store rejected row: {reason}"
                    );
                    let msg = batch
                        .messages()
                        .iter()
                        .find(|m| m.partition == r.partition && m.offset == r.offset);
                    if let Some(msg) = msg {
                        rejected.push(DeadLetter::new(topic, msg, Reason::Store { error: reason }));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    async fn send_dead_letter(&self, letter: &DeadLetter) -> Result<(), IngesterError> {
        let dead_letters = &self.dead_letters;
        self.retry
            .run(
                "sending dead letter",
                move || dead_letters.send(letter),
                DeadLetterError::disposition,
            )
            .await
            .map_err(|e| IngesterError::from(e.into_inner()))
    }

    async fn commit(&self, offsets: &Checkpoint) -> Result<(), IngesterError> {
        let consumer = &self.consumer;
        self.retry
            .run(
                "committing offsets",
                move || consumer.commit(offsets),
                ConsumerError::disposition,
            )
            .await
            .map_err(|e| IngesterError::from(e.into_inner()))
    }

    fn advance(&mut self, offsets: &Checkpoint) {
        for (&partition, &offset) in offsets {
            let committed = self.checkpoint.entry(partition).or_insert(offset);
            *committed = (*committed).max(offset);
        }
    }
}

impl<C: QueueConsumer + 'static, W: SinkWriter + 'static> Ingester<C, W> {
    /// Spawns the ingester on the runtime
    pub fn start(self) -> IngesterHandle {
        let shutdown = CancellationToken::new();
        let state = self.state();
        let task = tokio::spawn(self.run(shutdown.clone()));
        IngesterHandle {
            shutdown,
            state,
            task,
        }
    }
}

/// Control over a spawned ingester
pub struct IngesterHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<State>,
    task: JoinHandle<Result<(), IngesterError>>,
}

impl IngesterHandle {
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Resolves once the ingester reaches `state`
    pub async fn wait_for(&mut self, state: State) {
        let _ = self.state.wait_for(|s| *s == state).await;
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Asks the ingester to drain and stop
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn await_termination(self) -> Result<(), IngesterError> {
        match self.task.await {
            Ok(res) => res,
            Err(e) => Err(IngesterError::Aborted(e.to_string())),
        }
    }
}
