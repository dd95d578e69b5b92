//! SQLite storage handle.
//!
//! Hands out connections to the database file through a small lease pool:
//! a caller borrows a connection for the duration of one closure and the
//! connection goes back to the idle list afterwards. Connections are never
//! shared between threads while leased. WAL mode for concurrent readers;
//! `synchronous=OFF` hands syncing to the OS.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// How a transaction acquires the write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Lock lazily on first write. Fine for single-statement writes and reads.
    Deferred,
    /// Take the write lock at `BEGIN`. Required for read-then-delete sequences
    /// so two callers cannot both read the same row before either deletes it.
    Immediate,
}

impl TxMode {
    fn behavior(self) -> TransactionBehavior {
        match self {
            TxMode::Deferred => TransactionBehavior::Deferred,
            TxMode::Immediate => TransactionBehavior::Immediate,
        }
    }
}

/// Storage backend. Owns the idle connection pool for one database file.
pub struct Storage {
    path: PathBuf,
    busy_timeout: Duration,
    pool_size: usize,
    idle: Mutex<Vec<Connection>>,
}

impl Storage {
    /// Open or create the database at `config.location`.
    ///
    /// Fails with `InvalidConfiguration` for in-memory locations and with
    /// `StorageUnavailable` if the file cannot be opened.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        validate_location(&config.location)?;

        let storage = Self {
            path: config.location.clone(),
            busy_timeout: config.busy_timeout,
            pool_size: config.pool_size.max(1),
            idle: Mutex::new(Vec::new()),
        };

        let conn = storage.connect()?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|source| storage.unavailable(source))?;
        info!(path = %storage.path.display(), journal_mode = %mode, "storage opened");
        storage.checkin(conn);

        Ok(storage)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with a leased connection. The connection returns to the pool
    /// whether `f` succeeds or fails.
    pub(crate) fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.checkout()?;
        let result = f(&mut conn);
        self.checkin(conn);
        result
    }

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    pub(crate) fn with_transaction<F, T>(&self, mode: TxMode, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(mode.behavior())?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Run idempotent DDL (`CREATE TABLE IF NOT EXISTS ...`).
    pub(crate) fn ensure_schema(&self, ddl: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(ddl)?;
            Ok(())
        })
    }

    fn checkout(&self) -> Result<Connection> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => self.connect(),
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.pool_size {
            idle.push(conn);
        }
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|source| self.unavailable(source))?;
        configure(&conn, self.busy_timeout).map_err(|source| self.unavailable(source))?;
        debug!(path = %self.path.display(), "opened connection");
        Ok(conn)
    }

    fn unavailable(&self, source: rusqlite::Error) -> Error {
        Error::StorageUnavailable {
            path: self.path.clone(),
            source,
        }
    }
}

/// Per-connection pragmas. `journal_mode` is persistent in the file and is
/// set once in `Storage::open`.
fn configure(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA synchronous=OFF; PRAGMA temp_store=MEMORY;")?;
    Ok(())
}

/// Reject locations that would not survive a restart.
pub fn validate_location(path: &Path) -> Result<()> {
    let raw = path.to_string_lossy();
    let volatile = raw.is_empty()
        || raw == ":memory:"
        || raw.starts_with("file::memory:")
        || raw.contains("mode=memory");
    if volatile {
        return Err(Error::InvalidConfiguration(format!(
            "database location has to be a file path, in-memory databases are not supported (got {raw:?})"
        )));
    }
    Ok(())
}

/// Names end up inside table names, so only `[A-Za-z0-9_]` is allowed.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::InvalidConfiguration(format!(
            "name {name:?} must be 1-64 characters of [A-Za-z0-9_]"
        )));
    }
    Ok(())
}
