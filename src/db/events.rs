//! Event channel tables and the long-poll read.
//!
//! Each channel is an append-only table capped at `cap` rows. When an emit
//! pushes the count past the cap, the oldest rows are purged in one bulk
//! delete down to `floor`, inside the same transaction as the insert.
//!
//! `read` captures the newest id as a baseline and waits for rows with a
//! larger id. Emits from this process wake waiting readers through a shared
//! [`Notifier`]; the backoff sleep doubles as the wait timeout, so emits from
//! other processes are picked up on the next poll.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::backend::EventBus;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::{Storage, TxMode};
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_poll_tries, start_poll_span};

/// Growth of the poll interval per empty try.
const BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Wakes long-polls when a message is emitted in this process.
#[derive(Debug, Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    /// Current emit generation. Capture before polling storage so a wake-up
    /// between the poll and the wait is not lost.
    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Sleep until the generation moves past `seen` or `timeout` elapses.
    pub fn wait(&self, seen: u64, timeout: Duration) {
        let guard = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .cond
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Channel size limits and long-poll timing.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub cap: usize,
    pub floor: usize,
    pub initial_wait: Duration,
    pub max_wait: Duration,
}

impl From<&EngineConfig> for Retention {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cap: config.event_cap,
            floor: config.event_floor,
            initial_wait: config.poll_initial_wait,
            max_wait: config.poll_max_wait,
        }
    }
}

/// Next poll interval: grows by `tries * BACKOFF_STEP`, capped at `max`.
pub fn next_wait(wait: Duration, tries: u32, max: Duration) -> Duration {
    (wait + BACKOFF_STEP * tries).min(max)
}

/// Event channels stored as `taskq_events_{channel}` tables.
pub struct SqliteEventBus {
    storage: Arc<Storage>,
    notifier: Arc<Notifier>,
    retention: Retention,
    known: Mutex<HashSet<String>>,
}

impl SqliteEventBus {
    pub fn new(storage: Arc<Storage>, notifier: Arc<Notifier>, retention: Retention) -> Self {
        Self {
            storage,
            notifier,
            retention,
            known: Mutex::new(HashSet::new()),
        }
    }

    /// Table for `channel`, created on first use.
    fn channel_table(&self, channel: &str) -> Result<String> {
        let table = super::table_name("events", channel)?;
        if self
            .known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(channel)
        {
            return Ok(table);
        }

        // DDL runs outside the lock; CREATE IF NOT EXISTS tolerates the race.
        self.storage.ensure_schema(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                message TEXT
            );"
        ))?;
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string());
        Ok(table)
    }

    fn newest_id(&self, table: &str) -> Result<i64> {
        self.storage.with_connection(|conn| {
            Ok(conn
                .prepare_cached(&format!("SELECT COALESCE(MAX(id), 0) FROM {table}"))?
                .query_row([], |row| row.get(0))?)
        })
    }

    fn messages_after(&self, table: &str, last_id: i64) -> Result<Vec<(i64, String)>> {
        self.storage.with_connection(|conn| {
            let rows: Vec<(i64, String)> = conn
                .prepare_cached(&format!(
                    "SELECT id, message FROM {table} WHERE id > ?1 ORDER BY id ASC"
                ))?
                .query_map(params![last_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn record(channel: &str, operation: &'static str) {
        metrics::event_operations().add(
            1,
            &[
                KeyValue::new("channel", channel.to_string()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

/// Decode a stored message. Text that is not JSON comes back as a JSON
/// string so one bad row cannot wedge every reader of the channel.
fn decode(channel: &str, id: i64, raw: String) -> serde_json::Value {
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(channel, id, "undecodable event message: {e}");
            serde_json::Value::String(raw)
        }
    }
}

impl EventBus for SqliteEventBus {
    fn emit(&self, channel: &str, message: &serde_json::Value) -> Result<()> {
        let table = self.channel_table(channel)?;
        let text = serde_json::to_string(message)?;
        let Retention { cap, floor, .. } = self.retention;

        let trimmed = self.storage.with_transaction(TxMode::Immediate, |tx| {
            tx.prepare_cached(&format!("INSERT INTO {table} (message) VALUES (?1)"))?
                .execute(params![text])?;

            let count: i64 = tx
                .prepare_cached(&format!("SELECT COUNT(*) FROM {table}"))?
                .query_row([], |row| row.get(0))?;
            let count = count as usize;
            if count <= cap {
                return Ok(0);
            }

            // The row just inserted always survives the purge.
            let excess = (count - floor.max(1)) as i64;
            Ok(tx
                .prepare_cached(&format!(
                    "DELETE FROM {table} WHERE id IN
                     (SELECT id FROM {table} ORDER BY id ASC LIMIT ?1)"
                ))?
                .execute(params![excess])?)
        })?;

        self.notifier.notify();
        Self::record(channel, "emit");

        if trimmed > 0 {
            info!(channel, trimmed, floor, "event channel trimmed");
            metrics::events_trimmed().add(
                trimmed as u64,
                &[KeyValue::new("channel", channel.to_string())],
            );
        }
        Ok(())
    }

    fn read(&self, channel: &str, deadline: Option<Instant>) -> Result<Vec<serde_json::Value>> {
        let table = self.channel_table(channel)?;
        let span = start_poll_span(channel);
        let _enter = span.enter();

        let started = Instant::now();
        let last_id = self.newest_id(&table)?;
        let mut wait = self.retention.initial_wait;
        let mut tries: u32 = 0;

        loop {
            let seen = self.notifier.generation();
            let rows = self.messages_after(&table, last_id)?;

            if !rows.is_empty() {
                record_poll_tries(&span, tries);
                metrics::poll_wait_ms().record(
                    started.elapsed().as_secs_f64() * 1000.0,
                    &[KeyValue::new("channel", channel.to_string())],
                );
                Self::record(channel, "read");
                debug!(channel, last_id, count = rows.len(), tries, "long-poll returned");
                return Ok(rows
                    .into_iter()
                    .map(|(id, raw)| decode(channel, id, raw))
                    .collect());
            }

            let sleep = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        record_poll_tries(&span, tries);
                        Self::record(channel, "read_timeout");
                        return Ok(Vec::new());
                    }
                    wait.min(deadline - now)
                }
                None => wait,
            };

            self.notifier.wait(seen, sleep);
            tries += 1;
            wait = next_wait(wait, tries, self.retention.max_wait);
        }
    }

    fn length(&self, channel: &str) -> Result<usize> {
        let table = self.channel_table(channel)?;
        self.storage.with_connection(|conn| {
            let count: i64 = conn
                .prepare_cached(&format!("SELECT COUNT(*) FROM {table}"))?
                .query_row([], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}
