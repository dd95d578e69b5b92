//! SQLite implementation of the store roles.
//!
//! Every store for one database file shares a single [`Storage`] lease
//! pool. Tables are created idempotently when a store is built:
//!
//! - `taskq_queue_{name}(id, item BLOB)`
//! - `taskq_results_{name}(id, key TEXT, result BLOB)`
//! - `taskq_schedule_{name}(id, item BLOB, timestamp INTEGER)`
//! - `taskq_events_{channel}(id, message TEXT)`

pub mod events;
pub mod queue;
pub mod results;
pub mod schedule;

use std::sync::Arc;

pub use events::SqliteEventBus;
pub use queue::SqliteQueue;
pub use results::SqliteResultStore;
pub use schedule::SqliteSchedule;

use crate::backend::{Backend, EventBus, Queue, ResultStore, Schedule};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::{self, Storage};

use events::{Notifier, Retention};

/// Builds SQLite-backed stores over one database file.
pub struct SqliteBackend {
    storage: Arc<Storage>,
    notifier: Arc<Notifier>,
    retention: Retention,
}

impl SqliteBackend {
    /// Validate `config` and open its database file.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            storage: Arc::new(Storage::open(config)?),
            notifier: Arc::new(Notifier::default()),
            retention: Retention::from(config),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

impl Backend for SqliteBackend {
    fn queue(&self, name: &str) -> Result<Arc<dyn Queue>> {
        Ok(Arc::new(SqliteQueue::new(Arc::clone(&self.storage), name)?))
    }

    fn schedule(&self, name: &str) -> Result<Arc<dyn Schedule>> {
        Ok(Arc::new(SqliteSchedule::new(Arc::clone(&self.storage), name)?))
    }

    fn result_store(&self, name: &str) -> Result<Arc<dyn ResultStore>> {
        Ok(Arc::new(SqliteResultStore::new(
            Arc::clone(&self.storage),
            name,
        )?))
    }

    fn event_bus(&self) -> Result<Arc<dyn EventBus>> {
        Ok(Arc::new(SqliteEventBus::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.notifier),
            self.retention,
        )))
    }
}

/// `taskq_{kind}_{name}`, after checking `name` is a safe identifier.
pub(crate) fn table_name(kind: &str, name: &str) -> Result<String> {
    storage::validate_identifier(name)?;
    Ok(format!("taskq_{kind}_{name}"))
}
