//! Lifecycle events published by the engine.
//!
//! When a lifecycle channel is configured, every enqueue, dequeue, schedule,
//! promotion, and stored result is announced on it. Front-ends long-poll
//! the channel to show progress. Payload bytes are never included, only
//! their size.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A lifecycle event as stored on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskEvent {
    Enqueued {
        queue: String,
        bytes: usize,
        at: DateTime<Utc>,
    },
    Dequeued {
        queue: String,
        bytes: usize,
        at: DateTime<Utc>,
    },
    Scheduled {
        queue: String,
        due_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    Promoted {
        queue: String,
        count: usize,
        at: DateTime<Utc>,
    },
    ResultStored {
        key: String,
        bytes: usize,
        at: DateTime<Utc>,
    },
    /// A message that does not decode as a known event. Keeps the raw JSON.
    ///
    /// Decode-only: produced by [`TaskEvent::from_value`] and never
    /// serialized. Serializing it fails; re-publish `raw` itself instead.
    #[serde(skip)]
    Unknown { raw: serde_json::Value },
}

impl TaskEvent {
    /// Decode a message returned by `Engine::read_events`.
    pub fn from_value(value: serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or(TaskEvent::Unknown { raw: value })
    }

    /// Short status name, matching the serialized `status` tag.
    pub fn status(&self) -> &'static str {
        match self {
            TaskEvent::Enqueued { .. } => "enqueued",
            TaskEvent::Dequeued { .. } => "dequeued",
            TaskEvent::Scheduled { .. } => "scheduled",
            TaskEvent::Promoted { .. } => "promoted",
            TaskEvent::ResultStored { .. } => "result_stored",
            TaskEvent::Unknown { .. } => "unknown",
        }
    }
}
