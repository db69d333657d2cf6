//! PostgreSQL writer: one transaction per batch, multi-row INSERT,
//! duplicates skipped through the `message_id` primary key.
use std::fmt::Write as _;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{error::SqlState, types::ToSql, Client, Config, NoTls};
use tracing::{debug, error, info};

use super::{SinkError, SinkWriter};
use crate::record::{KeyedRecord, COLUMNS, KEY_COLUMN};

/// Max rows per INSERT statement, keeps parameters well below the PG limit
const CHUNK_SIZE: usize = 1000;

pub struct PostgresWriter {
    config: Config,
    table: String,
    create_table: bool,
    client: Mutex<Option<Client>>,
}

impl PostgresWriter {
    /// Doesn't connect yet, see [SinkWriter::connect]
    pub fn new(config: Config, table: &str, create_table: bool) -> Self {
        PostgresWriter {
            config,
            table: quote_table(table),
            create_table,
            client: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<Client, tokio_postgres::Error> {
        let (client, connection) = self.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {e}");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl SinkWriter for PostgresWriter {
    async fn connect(&self) -> Result<(), SinkError> {
        let mut guard = self.client.lock().await;
        let client = self.open().await.map_err(|e| classify(&e, &[]))?;
        if self.create_table {
            client
                .batch_execute(&create_table_statement(&self.table))
                .await
                .map_err(|e| classify(&e, &[]))?;
        }
        // a table that can't take our rows fails here instead of per row
        client
            .prepare(&insert_statement(&self.table, 1))
            .await
            .map_err(|e| classify(&e, &[]))?;
        info!(table = %self.table, "connected to postgres");
        *guard = Some(client);
        Ok(())
    }

    async fn insert(&self, records: &[KeyedRecord]) -> Result<u64, SinkError> {
        let mut guard = self.client.lock().await;
        let mut client = match guard.take() {
            Some(client) if !client.is_closed() => client,
            _ => {
                debug!("opening new postgres connection");
                self.open().await.map_err(|e| classify(&e, records))?
            }
        };
        let result = insert_rows(&mut client, &self.table, records).await;
        // a broken connection is dropped and reopened on the next attempt
        let keep = match &result {
            Ok(_) => true,
            Err(e) => fault(e) != Fault::Transient,
        };
        if keep && !client.is_closed() {
            *guard = Some(client);
        }
        result.map_err(|e| classify(&e, records))
    }
}

async fn insert_rows(
    client: &mut Client,
    table: &str,
    records: &[KeyedRecord],
) -> Result<u64, tokio_postgres::Error> {
    let tx = client.transaction().await?;
    let mut inserted = 0;
    for chunk in records.chunks(CHUNK_SIZE) {
        let sql = insert_statement(table, chunk.len());
        let mut params: Vec<&(dyn ToSql + Sync)> =
            Vec::with_capacity(chunk.len() * (COLUMNS.len() + 1));
        for r in chunk {
            params.push(&r.id);
            params.push(&r.record.full_name);
            params.push(&r.record.gender);
            params.push(&r.record.location);
            params.push(&r.record.city);
            params.push(&r.record.country);
            params.push(&r.record.postcode);
            params.push(&r.record.latitude);
            params.push(&r.record.longitude);
            params.push(&r.record.email);
        }
        inserted += tx.execute(sql.as_str(), &params).await?;
    }
    tx.commit().await?;
    Ok(inserted)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes each part of a possibly schema-qualified name
fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(|part| quote_ident(part.trim()))
        .collect::<Vec<_>>()
        .join(".")
}

fn create_table_statement(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            {key} UUID PRIMARY KEY,
            full_name TEXT NOT NULL,
            gender TEXT NOT NULL,
            location TEXT NOT NULL,
            city TEXT NOT NULL,
            country TEXT NOT NULL,
            postcode INTEGER NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            email TEXT NOT NULL
        )",
        key = quote_ident(KEY_COLUMN)
    )
}

fn insert_statement(table: &str, rows: usize) -> String {
    let width = COLUMNS.len() + 1;
    let columns = std::iter::once(KEY_COLUMN)
        .chain(COLUMNS)
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("INSERT INTO {table} ({columns}) VALUES ");
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..width {
            if col > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "${}", row * width + col + 1);
        }
        sql.push(')');
    }
    let _ = write!(sql, " ON CONFLICT ({}) DO NOTHING", quote_ident(KEY_COLUMN));
    sql
}

/// Who is to blame for a failed statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// connection or server state; the same statement may succeed later
    Transient,
    /// the data of some row; other rows may still go in
    Row,
    /// the table, its permissions or the statement itself; no row can go in
    Table,
}

fn fault(e: &tokio_postgres::Error) -> Fault {
    if e.is_closed() {
        return Fault::Transient;
    }
    match e.code() {
        Some(code) => fault_of(Some(code)),
        // no SQLSTATE: socket, connect and timeout failures carry an io error
        None if std::error::Error::source(e).is_some_and(|s| s.is::<std::io::Error>()) => {
            Fault::Transient
        }
        // client-side failures such as a column type the rows can't be bound to
        None => Fault::Table,
    }
}

/// Maps a SQLSTATE to a [Fault]. `None` means the server never answered.
fn fault_of(code: Option<&SqlState>) -> Fault {
    let Some(code) = code else {
        return Fault::Transient;
    };
    match code.code().get(..2) {
        // connection exception, transaction rollback, insufficient resources,
        // operator intervention, system error
        Some("08" | "40" | "53" | "57" | "58") => Fault::Transient,
        // data exception, integrity constraint violation, raised by a trigger
        Some("22" | "23" | "P0") => Fault::Row,
        _ => Fault::Table,
    }
}

fn describe(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!(
            "{} (sqlstate={} detail={})",
            db.message(),
            db.code().code(),
            db.detail().unwrap_or("n/a")
        ),
        None => e.to_string(),
    }
}

fn classify(e: &tokio_postgres::Error, records: &[KeyedRecord]) -> SinkError {
    match fault(e) {
        Fault::Transient => SinkError::Transient(describe(e)),
        Fault::Row => SinkError::Rejected {
            records: records.to_vec(),
            reason: describe(e),
        },
        Fault::Table => SinkError::Fatal(describe(e)),
    }
}
