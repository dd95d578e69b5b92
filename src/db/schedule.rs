//! Schedule table operations.
//!
//! Due times are stored as Unix epoch milliseconds. `read` selects and
//! deletes the due rows under one IMMEDIATE transaction, deleting by the
//! selected ids so the delivered set and the deleted set are the same rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use rusqlite::params;
use tracing::debug;

use crate::backend::{Payload, Schedule};
use crate::error::Result;
use crate::storage::{Storage, TxMode};
use crate::telemetry::metrics;

/// Deferred payloads for one queue, stored in `taskq_schedule_{name}`.
pub struct SqliteSchedule {
    storage: Arc<Storage>,
    name: String,
    sql: ScheduleSql,
}

struct ScheduleSql {
    add: String,
    due: String,
    remove_by_id: String,
    count: String,
    flush: String,
}

impl ScheduleSql {
    fn new(table: &str) -> Self {
        Self {
            add: format!("INSERT INTO {table} (item, timestamp) VALUES (?1, ?2)"),
            due: format!(
                "SELECT id, item FROM {table} WHERE timestamp <= ?1 ORDER BY timestamp, id"
            ),
            remove_by_id: format!("DELETE FROM {table} WHERE id = ?1"),
            count: format!("SELECT COUNT(*) FROM {table}"),
            flush: format!("DELETE FROM {table}"),
        }
    }
}

impl SqliteSchedule {
    /// Create the schedule table if needed.
    pub fn new(storage: Arc<Storage>, name: &str) -> Result<Self> {
        let table = super::table_name("schedule", name)?;
        storage.ensure_schema(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                item        BLOB,
                timestamp   INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp);"
        ))?;

        Ok(Self {
            storage,
            name: name.to_string(),
            sql: ScheduleSql::new(&table),
        })
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

impl Schedule for SqliteSchedule {
    fn add(&self, payload: &[u8], due_at: DateTime<Utc>) -> Result<()> {
        let timestamp = due_at.timestamp_millis();
        self.storage.with_connection(|conn| {
            conn.prepare_cached(&self.sql.add)?
                .execute(params![payload, timestamp])?;
            Ok(())
        })?;
        debug!(queue = %self.name, %due_at, "entry scheduled");
        self.record("schedule_add");
        Ok(())
    }

    fn read(&self, now: DateTime<Utc>) -> Result<Vec<Payload>> {
        let threshold = now.timestamp_millis();
        let items = self.storage.with_transaction(TxMode::Immediate, |tx| {
            let due = tx
                .prepare_cached(&self.sql.due)?
                .query_map(params![threshold], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Payload>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut remove = tx.prepare_cached(&self.sql.remove_by_id)?;
            let mut items = Vec::with_capacity(due.len());
            for (id, item) in due {
                remove.execute(params![id])?;
                items.push(item);
            }
            Ok(items)
        })?;

        debug!(queue = %self.name, %now, due = items.len(), "schedule drained");
        self.record("schedule_read");
        Ok(items)
    }

    fn flush(&self) -> Result<()> {
        self.storage.with_connection(|conn| {
            conn.execute(&self.sql.flush, [])?;
            Ok(())
        })?;
        self.record("schedule_flush");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn drained_in_due_order_not_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            Arc::new(Storage::open(&EngineConfig::new(dir.path().join("schedule.db"))).unwrap());
        let schedule = SqliteSchedule::new(storage, "ordering").unwrap();

        schedule.add(b"late", at(300)).unwrap();
        schedule.add(b"early", at(100)).unwrap();
        schedule.add(b"middle", at(200)).unwrap();
        schedule.add(b"future", at(10_000)).unwrap();

        let due = schedule.read(at(500)).unwrap();
        assert_eq!(
            due,
            vec![b"early".to_vec(), b"middle".to_vec(), b"late".to_vec()]
        );
        assert_eq!(schedule.length().unwrap(), 1);
    }

    #[test]
    fn boundary_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            Arc::new(Storage::open(&EngineConfig::new(dir.path().join("schedule.db"))).unwrap());
        let schedule = SqliteSchedule::new(storage, "boundary").unwrap();

        schedule.add(b"exact", at(100)).unwrap();
        assert_eq!(schedule.read(at(100)).unwrap(), vec![b"exact".to_vec()]);
    }
}
