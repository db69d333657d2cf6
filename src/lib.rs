//! ## pgafka
//! Service for real-time ingestion of JSON records from Kafka into PostgreSQL.
//!
//! ## Installation
//! Just use cargo.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! [kafka]
//! brokers = "kafka_broker_1:19092,kafka_broker_2:19093"
//! topic = "names_topic"
//! starting_offsets = "earliest"          # only used when the group has no offsets yet
//! batch_size = 1000
//! poll_timeout_ms = 10000
//!
//! [postgres]
//! url = "postgresql://localhost:5432/con-spark"   # "jdbc:" prefix is fine too
//! table = "json_table"
//! user = "postgres"
//! password = "secret"
//!
//! [retry]
//! max_retries = 5
//! backoff_base_ms = 250
//! backoff_ceiling_ms = 10000
//!
//! [dead_letter]
//! kind = "file"                          # "log", "file" or "kafka"
//! path = "./rejected.jsonl"
//! ```
//! Every key can be overridden from the environment, e.g. `PGAFKA__POSTGRES__PASSWORD`.
//!
//! ## Records
//! Messages are JSON objects with `full_name`, `gender`, `location`, `city`,
//! `country`, `postcode` (int32), `latitude`, `longitude` (float32) and `email`.
//! Anything else is rejected by the [decoder] and handed to the configured
//! [dead letter] destination; its offset is still committed.
//!
//! ## Kafka and PostgreSQL
//! pgafka uses Kafka's consumer groups and performs safe offset management ---
//! it will only commit offsets of messages that have been inserted into PG
//! (or dead-lettered). Each batch is inserted in a single transaction and every
//! row is keyed by its topic, partition and offset, so batches replayed after a
//! crash or a lost acknowledgement are not duplicated.
//!
//! [decoder]: decoder::JsonDecoder
//! [dead letter]: dead_letter::DeadLetterSink

pub mod consumer;
pub mod dead_letter;
pub mod decoder;
pub mod ingester;
pub mod record;
pub mod retry;
pub mod settings;
pub mod shutdown;
pub mod sink;
pub mod transform;
