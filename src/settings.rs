//! Application config
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::consumer::StartingOffsets;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("loading configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Source topic and consumer settings
#[derive(Debug, Clone, Deserialize)]
pub struct Kafka {
    /// comma separated list of bootstrap brokers, `host:port`
    pub brokers: String,
    /// topic to ingest
    pub topic: String,
    /// consumer group to use (default: `pgafka-<topic>`)
    pub consumer_group: Option<String>,
    /// where to start when the group has no committed offsets (default: earliest)
    pub starting_offsets: StartingOffsets,
    /// max messages per batch (default: 1000)
    pub batch_size: usize,
    /// how long to wait filling a batch (default: 10s)
    pub poll_timeout_ms: u64,
}

impl Kafka {
    pub fn broker_list(&self) -> Vec<&str> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect()
    }

    pub fn group(&self) -> String {
        match &self.consumer_group {
            Some(g) => g.to_owned(),
            None => format!("pgafka-{}", self.topic),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Target store settings
#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
    /// `postgresql://host:port/database`, `jdbc:` prefix is accepted
    pub url: String,
    /// table to append to, optionally schema-qualified
    pub table: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// create the table on startup if it doesn't exist (default: true)
    pub create_table: bool,
    /// upper bound for a single batch insert (default: 30s)
    pub write_timeout_seconds: u64,
}

impl Postgres {
    /// Connection config with credentials applied
    pub fn pg_config(&self) -> Result<tokio_postgres::Config, SettingsError> {
        let url = self.url.strip_prefix("jdbc:").unwrap_or(&self.url);
        let mut cfg: tokio_postgres::Config = url
            .parse()
            .map_err(|e: tokio_postgres::Error| invalid("postgres.url", e.to_string()))?;
        if let Some(user) = &self.user {
            cfg.user(user);
        }
        if let Some(password) = &self.password {
            cfg.password(password);
        }
        cfg.connect_timeout(self.write_timeout());
        Ok(cfg)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }
}

/// Backoff for every retried operation
#[derive(Debug, Clone, Deserialize)]
pub struct Retry {
    /// attempts after the first one before giving up (default: 5)
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
}

impl Retry {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_ceiling_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Decoder {
    /// accept `"12345"` for numeric columns (default: true)
    pub coerce_numeric_strings: bool,
}

/// Destination of rejected messages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeadLetter {
    /// structured log line only
    Log,
    /// JSON lines appended to a local file
    File { path: PathBuf },
    /// produced to a Kafka topic on the source cluster
    Kafka { topic: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub kafka: Kafka,
    pub postgres: Postgres,
    pub retry: Retry,
    pub decoder: Decoder,
    pub dead_letter: DeadLetter,
}

impl Settings {
    /// Loads defaults, optional `config/default`, the given file,
    /// then `PGAFKA__SECTION__KEY` environment variables.
    pub fn new(cfgfile: Option<&str>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder()
            .set_default("kafka.starting_offsets", "earliest")?
            .set_default("kafka.batch_size", 1000)?
            .set_default("kafka.poll_timeout_ms", 10_000)?
            .set_default("postgres.create_table", true)?
            .set_default("postgres.write_timeout_seconds", 30)?
            .set_default("retry.max_retries", 5)?
            .set_default("retry.backoff_base_ms", 250)?
            .set_default("retry.backoff_ceiling_ms", 10_000)?
            .set_default("decoder.coerce_numeric_strings", true)?
            .set_default("dead_letter.kind", "log")?
            .add_source(File::with_name("config/default").required(false));
        if let Some(cfgfile) = cfgfile {
            builder = builder.add_source(File::with_name(cfgfile).required(true));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix("PGAFKA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let brokers = self.kafka.broker_list();
        if brokers.is_empty() {
            return Err(invalid("kafka.brokers", "no brokers given"));
        }
        for broker in brokers {
            match broker.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                _ => {
                    return Err(invalid(
                        "kafka.brokers",
                        format!("{broker:?} is not host:port"),
                    ))
                }
            }
        }
        if self.kafka.topic.trim().is_empty() {
            return Err(invalid("kafka.topic", "must not be empty"));
        }
        if self.kafka.batch_size == 0 {
            return Err(invalid("kafka.batch_size", "must be positive"));
        }
        if self.kafka.poll_timeout_ms == 0 {
            return Err(invalid("kafka.poll_timeout_ms", "must be positive"));
        }
        if self.postgres.table.split('.').any(|part| part.trim().is_empty()) {
            return Err(invalid(
                "postgres.table",
                format!("{:?} is not a table name", self.postgres.table),
            ));
        }
        self.postgres.pg_config()?;
        if let DeadLetter::Kafka { topic } = &self.dead_letter {
            if topic == &self.kafka.topic {
                return Err(invalid(
                    "dead_letter.topic",
                    "must differ from the source topic",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio_postgres::config::Host;

    use super::*;

    fn load(toml: &str) -> Result<Settings, SettingsError> {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        f.write_all(toml.as_bytes()).unwrap();
        Settings::new(Some(f.path().to_str().unwrap()))
    }

    const MINIMAL: &str = r#"
        [kafka]
        brokers = "kafka_broker_1:19092, kafka_broker_2:19093,kafka_broker_3:19094"
        topic = "names_topic"

        [postgres]
        url = "jdbc:postgresql://localhost:5432/con-spark"
        table = "json_table"
        user = "postgres"
        password = "secret"
    "#;

    #[test]
    fn fills_defaults() {
        let s = load(MINIMAL).unwrap();
        assert_eq!(
            s.kafka.broker_list(),
            vec!["kafka_broker_1:19092", "kafka_broker_2:19093", "kafka_broker_3:19094"]
        );
        assert_eq!(s.kafka.group(), "pgafka-names_topic");
        assert_eq!(s.kafka.starting_offsets, StartingOffsets::Earliest);
        assert_eq!(s.kafka.batch_size, 1000);
        assert_eq!(s.kafka.poll_timeout(), Duration::from_secs(10));
        assert!(s.postgres.create_table);
        assert_eq!(s.retry.policy().max_attempts, 6);
        assert!(s.decoder.coerce_numeric_strings);
        assert_eq!(s.dead_letter, DeadLetter::Log);
    }

    #[test]
    fn accepts_jdbc_url() {
        let s = load(MINIMAL).unwrap();
        let pg = s.postgres.pg_config().unwrap();
        assert_eq!(pg.get_hosts(), &[Host::Tcp("localhost".into())]);
        assert_eq!(pg.get_ports(), &[5432]);
        assert_eq!(pg.get_dbname(), Some("con-spark"));
        assert_eq!(pg.get_user(), Some("postgres"));
    }

    #[test]
    fn reads_overrides() {
        let s = load(&format!(
            "{MINIMAL}
            [retry]
            max_retries = 2
            [dead_letter]
            kind = \"file\"
            path = \"/tmp/rejects.jsonl\"
            "
        ))
        .unwrap();
        assert_eq!(s.retry.max_retries, 2);
        assert_eq!(
            s.dead_letter,
            DeadLetter::File {
                path: PathBuf::from("/tmp/rejects.jsonl")
            }
        );
    }

    #[test]
    fn rejects_unknown_starting_offsets() {
        let cfg = MINIMAL.replace(
            "topic = \"names_topic\"",
            "topic = \"names_topic\"\nstarting_offsets = \"middle\"",
        );
        assert!(matches!(load(&cfg), Err(SettingsError::Load(_))));
    }

    #[test]
    fn rejects_bad_broker() {
        let cfg = MINIMAL.replace("kafka_broker_2:19093", "kafka_broker_2");
        assert!(matches!(
            load(&cfg),
            Err(SettingsError::Invalid {
                key: "kafka.brokers",
                ..
            })
        ));
    }

    #[test]
    fn rejects_missing_topic() {
        let cfg = MINIMAL.replace("topic = \"names_topic\"", "");
        assert!(load(&cfg).is_err());
    }

    #[test]
    fn rejects_dead_letter_loop() {
        let cfg = format!("{MINIMAL}\n[dead_letter]\nkind = \"kafka\"\ntopic = \"names_topic\"\n");
        assert!(matches!(
            load(&cfg),
            Err(SettingsError::Invalid {
                key: "dead_letter.topic",
                ..
            })
        ));
    }
}
