//! Result store table operations.
//!
//! Replace-on-write: `put` deletes any existing row for the key before
//! inserting, inside one transaction, so a key never holds more than one
//! value. `get` reads and deletes in one IMMEDIATE transaction.

use std::sync::Arc;

use opentelemetry::KeyValue;
use rusqlite::{OptionalExtension, params};
use tracing::debug;

use crate::backend::{Payload, ResultStore};
use crate::error::Result;
use crate::storage::{Storage, TxMode};
use crate::telemetry::metrics;

/// Results for one engine instance, stored in `taskq_results_{name}`.
pub struct SqliteResultStore {
    storage: Arc<Storage>,
    sql: ResultSql,
}

struct ResultSql {
    put: String,
    peek: String,
    remove: String,
    flush: String,
}

impl ResultSql {
    fn new(table: &str) -> Self {
        Self {
            put: format!("INSERT INTO {table} (key, result) VALUES (?1, ?2)"),
            peek: format!("SELECT result FROM {table} WHERE key = ?1 ORDER BY id DESC LIMIT 1"),
            remove: format!("DELETE FROM {table} WHERE key = ?1"),
            flush: format!("DELETE FROM {table}"),
        }
    }
}

impl SqliteResultStore {
    /// Create the result table if needed.
    pub fn new(storage: Arc<Storage>, name: &str) -> Result<Self> {
        let table = super::table_name("results", name)?;
        storage.ensure_schema(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                key     TEXT,
                result  BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_key ON {table}(key);"
        ))?;

        Ok(Self {
            storage,
            sql: ResultSql::new(&table),
        })
    }
}

fn record(operation: &'static str) {
    metrics::result_operations().add(1, &[KeyValue::new("operation", operation)]);
}

impl ResultStore for SqliteResultStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.storage.with_transaction(TxMode::Immediate, |tx| {
            tx.prepare_cached(&self.sql.remove)?.execute(params![key])?;
            tx.prepare_cached(&self.sql.put)?
                .execute(params![key, value])?;
            Ok(())
        })?;
        debug!(key, bytes = value.len(), "result stored");
        record("put");
        Ok(())
    }

    fn peek(&self, key: &str) -> Result<Option<Payload>> {
        let value: Option<Payload> = self.storage.with_connection(|conn| {
            Ok(conn
                .prepare_cached(&self.sql.peek)?
                .query_row(params![key], |row| row.get(0))
                .optional()?)
        })?;
        record(if value.is_some() { "peek" } else { "miss" });
        Ok(value)
    }

    fn get(&self, key: &str) -> Result<Option<Payload>> {
        let value = self.storage.with_transaction(TxMode::Immediate, |tx| {
            let value: Option<Payload> = tx
                .prepare_cached(&self.sql.peek)?
                .query_row(params![key], |row| row.get(0))
                .optional()?;
            if value.is_some() {
                tx.prepare_cached(&self.sql.remove)?.execute(params![key])?;
            }
            Ok(value)
        })?;
        debug!(key, found = value.is_some(), "result consumed");
        record(if value.is_some() { "get" } else { "miss" });
        Ok(value)
    }

    fn flush(&self) -> Result<()> {
        self.storage.with_connection(|conn| {
            conn.execute(&self.sql.flush, [])?;
            Ok(())
        })?;
        record("flush");
        Ok(())
    }
}
