//! Typed configuration for the engine and the `taskq` binary.
//!
//! `EngineConfig` carries every knob the engine honors. `Config` wraps it
//! with process-level settings and loads once at startup, from environment
//! variables or a TOML file, failing fast on anything missing or malformed.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::storage;

pub const DEFAULT_NAME: &str = "taskq";
pub const DEFAULT_EVENT_CAP: usize = 500;
pub const DEFAULT_EVENT_FLOOR: usize = DEFAULT_EVENT_CAP - 200;
pub const DEFAULT_POLL_INITIAL_WAIT: Duration = Duration::from_millis(100);
pub const DEFAULT_POLL_MAX_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Instance name. Scopes the result store table.
    pub name: String,
    /// Path of the SQLite database file. Must be durable.
    pub location: PathBuf,
    /// Maximum number of records kept per event channel before trimming.
    pub event_cap: usize,
    /// Record count a channel is trimmed down to once it exceeds the cap.
    pub event_floor: usize,
    /// First sleep of an idle long-poll.
    pub poll_initial_wait: Duration,
    /// Upper bound for the long-poll sleep.
    pub poll_max_wait: Duration,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
    /// Maximum number of idle connections kept for reuse.
    pub pool_size: usize,
    /// When set, the engine publishes a `TaskEvent` here for every operation.
    pub lifecycle_channel: Option<String>,
}

impl EngineConfig {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            location: location.into(),
            event_cap: DEFAULT_EVENT_CAP,
            event_floor: DEFAULT_EVENT_FLOOR,
            poll_initial_wait: DEFAULT_POLL_INITIAL_WAIT,
            poll_max_wait: DEFAULT_POLL_MAX_WAIT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            pool_size: DEFAULT_POOL_SIZE,
            lifecycle_channel: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the channel cap and the floor it is trimmed down to.
    pub fn event_retention(mut self, cap: usize, floor: usize) -> Self {
        self.event_cap = cap;
        self.event_floor = floor;
        self
    }

    pub fn poll_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial_wait = initial;
        self.poll_max_wait = max;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn lifecycle_channel(mut self, channel: impl Into<String>) -> Self {
        self.lifecycle_channel = Some(channel.into());
        self
    }

    /// Check every setting the engine depends on.
    pub fn validate(&self) -> Result<()> {
        storage::validate_location(&self.location)?;
        storage::validate_identifier(&self.name)?;
        if let Some(ref channel) = self.lifecycle_channel {
            storage::validate_identifier(channel)?;
        }
        if self.event_cap == 0 {
            return Err(Error::InvalidConfiguration(
                "event_cap must be greater than zero".to_string(),
            ));
        }
        if self.event_floor == 0 {
            return Err(Error::InvalidConfiguration(
                "event_floor must be greater than zero".to_string(),
            ));
        }
        if self.event_floor >= self.event_cap {
            return Err(Error::InvalidConfiguration(format!(
                "event_floor ({}) must be below event_cap ({})",
                self.event_floor, self.event_cap
            )));
        }
        if self.poll_initial_wait > self.poll_max_wait {
            return Err(Error::InvalidConfiguration(format!(
                "poll_initial_wait ({:?}) exceeds poll_max_wait ({:?})",
                self.poll_initial_wait, self.poll_max_wait
            )));
        }
        if self.pool_size == 0 {
            return Err(Error::InvalidConfiguration(
                "pool_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-level configuration for the `taskq` binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut engine = EngineConfig::new(required_var("TASKQ_DB_PATH")?);
        if let Ok(name) = std::env::var("TASKQ_NAME") {
            engine.name = name;
        }
        if let Some(cap) = parsed_var("TASKQ_EVENT_CAP")? {
            engine.event_cap = cap;
            engine.event_floor = default_floor(cap);
        }
        if let Some(floor) = parsed_var("TASKQ_EVENT_FLOOR")? {
            engine.event_floor = floor;
        }
        if let Some(ms) = parsed_var("TASKQ_POLL_INITIAL_MS")? {
            engine.poll_initial_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed_var("TASKQ_POLL_MAX_MS")? {
            engine.poll_max_wait = Duration::from_millis(ms);
        }
        engine.lifecycle_channel = std::env::var("TASKQ_LIFECYCLE_CHANNEL").ok();

        Ok(Self {
            engine,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;

        let section = file.engine;
        let mut engine = EngineConfig::new(section.location);
        if let Some(name) = section.name {
            engine.name = name;
        }
        if let Some(cap) = section.event_cap {
            engine.event_cap = cap;
            engine.event_floor = default_floor(cap);
        }
        if let Some(floor) = section.event_floor {
            engine.event_floor = floor;
        }
        if let Some(ms) = section.poll_initial_wait_ms {
            engine.poll_initial_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = section.poll_max_wait_ms {
            engine.poll_max_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = section.busy_timeout_ms {
            engine.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = section.pool_size {
            engine.pool_size = size;
        }
        engine.lifecycle_channel = section.lifecycle_channel;

        Ok(Self {
            engine,
            otel_endpoint: file.telemetry.otel_endpoint,
            log_level: file.telemetry.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    engine: EngineSection,
    #[serde(default)]
    telemetry: TelemetrySection,
}

#[derive(Debug, Deserialize)]
struct EngineSection {
    location: PathBuf,
    name: Option<String>,
    event_cap: Option<usize>,
    event_floor: Option<usize>,
    poll_initial_wait_ms: Option<u64>,
    poll_max_wait_ms: Option<u64>,
    busy_timeout_ms: Option<u64>,
    pool_size: Option<usize>,
    lifecycle_channel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TelemetrySection {
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

/// Floor used when only the cap is given: 200 below the cap, but never
/// under half of it.
pub fn default_floor(cap: usize) -> usize {
    cap.saturating_sub(200).max(cap / 2).max(1)
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        EngineConfig::new("/tmp/taskq.db").validate().unwrap();
    }

    #[test]
    fn floor_must_stay_below_cap() {
        let config = EngineConfig::new("/tmp/taskq.db").event_retention(100, 100);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn zero_floor_is_rejected() {
        let config = EngineConfig::new("/tmp/taskq.db").event_retention(3, 0);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn small_cap_derives_nonzero_floor() {
        assert_eq!(default_floor(500), 300);
        assert_eq!(default_floor(1000), 800);
        assert_eq!(default_floor(150), 75);
        assert_eq!(default_floor(2), 1);

        let config = Config::from_toml("[engine]\nlocation = \"/tmp/q.db\"\nevent_cap = 150\n").unwrap();
        assert_eq!(config.engine.event_floor, 75);
        config.engine.validate().unwrap();
    }

    #[test]
    fn initial_wait_cannot_exceed_max() {
        let config = EngineConfig::new("/tmp/taskq.db")
            .poll_backoff(Duration::from_secs(3), Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn memory_location_is_rejected() {
        let config = EngineConfig::new(":memory:");
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn toml_fills_only_given_fields() {
        let config = Config::from_toml(
            r#"
            [engine]
            location = "/var/lib/taskq/queue.db"
            name = "scans"
            event_cap = 1000

            [telemetry]
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.name, "scans");
        assert_eq!(config.engine.event_cap, 1000);
        assert_eq!(config.engine.event_floor, 800);
        assert_eq!(config.engine.poll_max_wait, DEFAULT_POLL_MAX_WAIT);
        assert_eq!(config.log_level, "debug");
        assert!(config.otel_endpoint.is_none());
    }

    #[test]
    fn toml_without_location_fails() {
        let result = Config::from_toml("[engine]\nname = \"scans\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
