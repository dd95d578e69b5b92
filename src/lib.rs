//! # taskq
//!
//! Embedded task-queue engine on SQLite.
//!
//! Provides durable FIFO queues, a replace-on-write result store, a
//! time-ordered schedule of deferred payloads, and capped event channels
//! with a long-poll read, all safe to use from many worker threads and
//! processes against one database file.

pub mod backend;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod storage;
pub mod telemetry;

pub use backend::Payload;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use event::TaskEvent;
