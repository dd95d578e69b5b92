//! Store roles the engine composes.
//!
//! A backend provides four stores: a FIFO `Queue`, a keyed `ResultStore`, a
//! time-ordered `Schedule`, and a capped `EventBus`. The engine only talks
//! to these traits; `crate::db` is the SQLite implementation.
//!
//! Absence is `None`, never a special payload: `Some(vec![])` is a valid,
//! empty payload.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Opaque work or result bytes.
pub type Payload = Vec<u8>;

/// Durable FIFO of opaque payloads.
pub trait Queue: Send + Sync {
    /// Append a payload.
    fn write(&self, payload: &[u8]) -> Result<()>;

    /// Remove and return the oldest payload. At most one caller ever
    /// observes a given item. `None` if the queue is empty.
    fn read(&self) -> Result<Option<Payload>>;

    /// Delete every item whose payload equals `payload`. Returns the count.
    fn remove(&self, payload: &[u8]) -> Result<usize>;

    fn flush(&self) -> Result<()>;

    fn length(&self) -> Result<usize>;
}

/// Keyed, replace-on-write store of result payloads.
pub trait ResultStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read without consuming.
    fn peek(&self, key: &str) -> Result<Option<Payload>>;

    /// Read and delete in one transaction.
    fn get(&self, key: &str) -> Result<Option<Payload>>;

    fn flush(&self) -> Result<()>;
}

/// Deferred payloads waiting for their due time.
pub trait Schedule: Send + Sync {
    fn add(&self, payload: &[u8], due_at: DateTime<Utc>) -> Result<()>;

    /// Remove and return every entry with `due_at <= now`, ascending by due
    /// time. The returned set and the deleted set are identical.
    fn read(&self, now: DateTime<Utc>) -> Result<Vec<Payload>>;

    fn flush(&self) -> Result<()>;

    fn length(&self) -> Result<usize>;
}

/// Size-capped, per-channel log of JSON messages with a long-poll read.
pub trait EventBus: Send + Sync {
    /// Append a message; trims the channel when it grows past its cap.
    fn emit(&self, channel: &str, message: &serde_json::Value) -> Result<()>;

    /// Block until messages newer than the channel's newest record at call
    /// time appear, then return all of them in arrival order. With a
    /// `deadline`, returns an empty vec once it passes.
    fn read(&self, channel: &str, deadline: Option<Instant>) -> Result<Vec<serde_json::Value>>;

    /// Number of records currently retained on `channel`.
    fn length(&self, channel: &str) -> Result<usize>;
}

/// Builds the stores for a named queue or instance.
pub trait Backend: Send + Sync {
    fn queue(&self, name: &str) -> Result<Arc<dyn Queue>>;

    fn schedule(&self, name: &str) -> Result<Arc<dyn Schedule>>;

    fn result_store(&self, name: &str) -> Result<Arc<dyn ResultStore>>;

    fn event_bus(&self) -> Result<Arc<dyn EventBus>>;
}
