//! FIFO queue table operations.
//!
//! `read` runs under an IMMEDIATE transaction: the oldest row is selected
//! and deleted while the write lock is held, so a row is handed to at most
//! one caller across threads and processes.

use std::sync::Arc;

use opentelemetry::KeyValue;
use rusqlite::{OptionalExtension, params};
use tracing::debug;

use crate::backend::{Payload, Queue};
use crate::error::Result;
use crate::storage::{Storage, TxMode};
use crate::telemetry::metrics;

/// A named queue stored in `taskq_queue_{name}`.
pub struct SqliteQueue {
    storage: Arc<Storage>,
    name: String,
    sql: QueueSql,
}

struct QueueSql {
    append: String,
    head: String,
    remove_by_id: String,
    remove_by_value: String,
    count: String,
    flush: String,
}

impl QueueSql {
    fn new(table: &str) -> Self {
        Self {
            append: format!("INSERT INTO {table} (item) VALUES (?1)"),
            head: format!("SELECT id, item FROM {table} ORDER BY id LIMIT 1"),
            remove_by_id: format!("DELETE FROM {table} WHERE id = ?1"),
            remove_by_value: format!("DELETE FROM {table} WHERE item = ?1"),
            count: format!("SELECT COUNT(*) FROM {table}"),
            flush: format!("DELETE FROM {table}"),
        }
    }
}

impl SqliteQueue {
    /// Create the queue table if needed.
    pub fn new(storage: Arc<Storage>, name: &str) -> Result<Self> {
        let table = super::table_name("queue", name)?;
        storage.ensure_schema(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                item    BLOB
            );"
        ))?;

        Ok(Self {
            storage,
            name: name.to_string(),
            sql: QueueSql::new(&table),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

impl Queue for SqliteQueue {
    fn write(&self, payload: &[u8]) -> Result<()> {
        self.storage.with_connection(|conn| {
            conn.prepare_cached(&self.sql.append)?
                .execute(params![payload])?;
            Ok(())
        })?;
        debug!(queue = %self.name, bytes = payload.len(), "item written");
        self.record("write");
        Ok(())
    }

    fn read(&self) -> Result<Option<Payload>> {
        let item = self.storage.with_transaction(TxMode::Immediate, |tx| {
            let head: Option<(i64, Payload)> = tx
                .prepare_cached(&self.sql.head)?
                .query_row([], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;

            let Some((id, item)) = head else {
                return Ok(None);
            };
            tx.prepare_cached(&self.sql.remove_by_id)?
                .execute(params![id])?;
            debug!(queue = %self.name, id, "item read");
            Ok(Some(item))
        })?;

        self.record(if item.is_some() { "read" } else { "read_empty" });
        Ok(item)
    }

    fn remove(&self, payload: &[u8]) -> Result<usize> {
        let removed = self.storage.with_connection(|conn| {
            Ok(conn
                .prepare_cached(&self.sql.remove_by_value)?
                .execute(params![payload])?)
        })?;
        debug!(queue = %self.name, removed, "items removed by value");
        self.record("remove");
        Ok(removed)
    }

    fn flush(&self) -> Result<()> {
        self.storage.with_connection(|conn| {
            conn.execute(&self.sql.flush, [])?;
            Ok(())
        })?;
        self.record("flush");
        Ok(())
    }

    fn length(&self) -> Result<usize> {
        self.storage.with_connection(|conn| {
            let count: i64 = conn
                .prepare_cached(&self.sql.count)?
                .query_row([], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}
