//! Core engine. The public API for producers, workers, and subscribers.
//!
//! The engine composes a backend's four stores under one instance name:
//! queues and schedules are created per queue name on first use, the result
//! store is scoped by the instance name, and event channels are shared.
//! It holds no queue contents in memory; every call goes to storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{Backend, EventBus, Payload, Queue, ResultStore, Schedule};
use crate::config::EngineConfig;
use crate::db::SqliteBackend;
use crate::error::Result;
use crate::event::TaskEvent;
use crate::telemetry::metrics;
use crate::telemetry::spans::start_queue_span;

/// The task engine. `Send + Sync`; share it across workers with `Arc`.
pub struct Engine {
    name: String,
    backend: Arc<dyn Backend>,
    results: Arc<dyn ResultStore>,
    events: Arc<dyn EventBus>,
    queues: Mutex<HashMap<String, QueueStores>>,
    lifecycle_channel: Option<String>,
}

/// Queue and schedule for one queue name.
#[derive(Clone)]
struct QueueStores {
    queue: Arc<dyn Queue>,
    schedule: Arc<dyn Schedule>,
}

impl Engine {
    /// Open an engine backed by the SQLite file in `config.location`.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let backend = SqliteBackend::open(config)?;
        let engine = Self::with_backend(&config.name, Arc::new(backend))?;
        info!(name = %config.name, location = %config.location.display(), "engine opened");
        Ok(match config.lifecycle_channel {
            Some(ref channel) => engine.with_lifecycle_events(channel),
            None => engine,
        })
    }

    /// Compose an engine from any backend.
    pub fn with_backend(name: &str, backend: Arc<dyn Backend>) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            results: backend.result_store(name)?,
            events: backend.event_bus()?,
            backend,
            queues: Mutex::new(HashMap::new()),
            lifecycle_channel: None,
        })
    }

    /// Publish a [`TaskEvent`] on `channel` for every operation.
    ///
    /// Events are emitted after the operation commits, in a separate
    /// transaction. If the emit fails the operation still returns its
    /// committed result; the failure is logged and counted on
    /// `taskq.lifecycle.failures`.
    pub fn with_lifecycle_events(mut self, channel: impl Into<String>) -> Self {
        self.lifecycle_channel = Some(channel.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn stores(&self, queue_name: &str) -> Result<QueueStores> {
        if let Some(stores) = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
        {
            return Ok(stores.clone());
        }

        // Built outside the lock; table creation is idempotent.
        let built = QueueStores {
            queue: self.backend.queue(queue_name)?,
            schedule: self.backend.schedule(queue_name)?,
        };
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(queues
            .entry(queue_name.to_string())
            .or_insert(built)
            .clone())
    }

    /// Publish a lifecycle event for an operation that already committed.
    /// Failures are logged and counted, not returned.
    fn announce(&self, event: TaskEvent) {
        let Some(ref channel) = self.lifecycle_channel else {
            return;
        };
        if let Err(e) = self.emit_event(channel, &event) {
            warn!(channel = %channel, status = event.status(), "lifecycle event dropped: {e}");
            metrics::lifecycle_failures().add(
                1,
                &[
                    KeyValue::new("channel", channel.clone()),
                    KeyValue::new("status", event.status()),
                ],
            );
        }
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Append a payload to `queue_name`.
    pub fn enqueue(&self, queue_name: &str, payload: &[u8]) -> Result<()> {
        let _span = start_queue_span("enqueue", queue_name).entered();
        self.stores(queue_name)?.queue.write(payload)?;
        self.announce(TaskEvent::Enqueued {
            queue: queue_name.to_string(),
            bytes: payload.len(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Take the oldest payload from `queue_name`. Returns `None` immediately
    /// when the queue is empty; retrying is up to the caller.
    pub fn dequeue(&self, queue_name: &str) -> Result<Option<Payload>> {
        let _span = start_queue_span("dequeue", queue_name).entered();
        let item = self.stores(queue_name)?.queue.read()?;
        if let Some(ref payload) = item {
            self.announce(TaskEvent::Dequeued {
                queue: queue_name.to_string(),
                bytes: payload.len(),
                at: Utc::now(),
            });
        }
        Ok(item)
    }

    /// Cancel by value: delete every queued item equal to `payload`.
    pub fn remove(&self, queue_name: &str, payload: &[u8]) -> Result<usize> {
        self.stores(queue_name)?.queue.remove(payload)
    }

    pub fn queue_len(&self, queue_name: &str) -> Result<usize> {
        self.stores(queue_name)?.queue.length()
    }

    // -----------------------------------------------------------------------
    // Schedule
    // -----------------------------------------------------------------------

    /// Hold `payload` until `due_at`, then make it eligible for promotion.
    pub fn schedule(&self, queue_name: &str, payload: &[u8], due_at: DateTime<Utc>) -> Result<()> {
        let _span = start_queue_span("schedule", queue_name).entered();
        self.stores(queue_name)?.schedule.add(payload, due_at)?;
        self.announce(TaskEvent::Scheduled {
            queue: queue_name.to_string(),
            due_at,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Schedule relative to now.
    pub fn schedule_after(
        &self,
        queue_name: &str,
        payload: &[u8],
        delay: chrono::Duration,
    ) -> Result<()> {
        self.schedule(queue_name, payload, Utc::now() + delay)
    }

    /// Remove and return every entry due at `now`, in due-time order.
    pub fn drain_due(&self, queue_name: &str, now: DateTime<Utc>) -> Result<Vec<Payload>> {
        let _span = start_queue_span("drain_due", queue_name).entered();
        self.stores(queue_name)?.schedule.read(now)
    }

    /// One promoter tick: move every entry due at `now` onto the queue.
    ///
    /// The drain and the writes are separate transactions. A failed write
    /// aborts the tick with the error; entries already drained but not yet
    /// written are lost, like a worker crashing after dequeue.
    pub fn promote_due(&self, queue_name: &str, now: DateTime<Utc>) -> Result<usize> {
        let _span = start_queue_span("promote", queue_name).entered();
        let stores = self.stores(queue_name)?;
        let due = stores.schedule.read(now)?;
        for payload in &due {
            stores.queue.write(payload)?;
        }
        if !due.is_empty() {
            debug!(queue = queue_name, count = due.len(), "promoted due entries");
            self.announce(TaskEvent::Promoted {
                queue: queue_name.to_string(),
                count: due.len(),
                at: Utc::now(),
            });
        }
        Ok(due.len())
    }

    pub fn scheduled_len(&self, queue_name: &str) -> Result<usize> {
        self.stores(queue_name)?.schedule.length()
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Store `value` under `key`, replacing any previous value.
    pub fn put_result(&self, key: &str, value: &[u8]) -> Result<()> {
        self.results.put(key, value)?;
        self.announce(TaskEvent::ResultStored {
            key: key.to_string(),
            bytes: value.len(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Read a result without consuming it. `None` means "not ready yet".
    pub fn peek_result(&self, key: &str) -> Result<Option<Payload>> {
        self.results.peek(key)
    }

    /// Read and consume a result. `None` means "not ready yet".
    pub fn get_result(&self, key: &str) -> Result<Option<Payload>> {
        self.results.get(key)
    }

    pub fn flush_results(&self) -> Result<()> {
        self.results.flush()
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Serialize `message` and publish it on `channel`.
    pub fn emit_event<T: Serialize + ?Sized>(&self, channel: &str, message: &T) -> Result<()> {
        let value = serde_json::to_value(message)?;
        self.events.emit(channel, &value)
    }

    /// Block until messages newer than the channel's current newest record
    /// arrive, and return all of them oldest first.
    pub fn read_events(&self, channel: &str) -> Result<Vec<serde_json::Value>> {
        self.events.read(channel, None)
    }

    /// Like [`Engine::read_events`], but gives up after `timeout` and
    /// returns an empty vec. A timeout too large to represent waits forever.
    pub fn read_events_timeout(
        &self,
        channel: &str,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Value>> {
        self.events.read(channel, Instant::now().checked_add(timeout))
    }

    /// Records currently retained on `channel`.
    pub fn event_count(&self, channel: &str) -> Result<usize> {
        self.events.length(channel)
    }

    // -----------------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------------

    /// Clear `queue_name`'s queue and schedule and the instance's results.
    /// A no-op on empty stores.
    pub fn flush(&self, queue_name: &str) -> Result<()> {
        let stores = self.stores(queue_name)?;
        stores.queue.flush()?;
        stores.schedule.flush()?;
        self.results.flush()?;
        info!(queue = queue_name, "flushed");
        Ok(())
    }
}
