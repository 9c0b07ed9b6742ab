//! Worker configuration.

use serde::{Deserialize, Serialize};
use shared_bus::DEFAULT_MESSAGE_TTL;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default number of items a worker handles at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Configuration for one worker bound to one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue this worker consumes (e.g. `IDENTITY`, `ORDER`)
    pub queue: String,
    /// Prefetch and maximum concurrently running handlers
    pub concurrency: usize,
    /// Queue TTL; requests older than this are dropped by the broker
    #[serde(with = "shared_types::duration_str")]
    pub message_ttl: Duration,
    /// First delay before re-consuming after connection loss
    #[serde(with = "shared_types::duration_str")]
    pub reconnect_backoff: Duration,
    /// Upper bound for the reconnect delay
    #[serde(with = "shared_types::duration_str")]
    pub max_reconnect_backoff: Duration,
    /// Suppress re-execution of redelivered items completed this recently.
    /// `None` disables deduplication.
    #[serde(with = "shared_types::duration_str::option")]
    pub dedup_window: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: "HEALTH".to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            message_ttl: DEFAULT_MESSAGE_TTL,
            reconnect_backoff: Duration::from_millis(100),
            max_reconnect_backoff: Duration::from_secs(5),
            dedup_window: None,
        }
    }
}

impl WorkerConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    /// Build the configuration for `queue` from `COURIER_*` variables.
    ///
    /// - `COURIER_WORKER_CONCURRENCY`
    /// - `COURIER_MESSAGE_TTL_MS`
    /// - `COURIER_DEDUP_WINDOW_SECS` (unset or `0` disables)
    pub fn from_env(queue: impl Into<String>) -> Result<Self, ConfigError> {
        let mut config = Self::for_queue(queue);

        if let Some(concurrency) = env_parse::<usize>("COURIER_WORKER_CONCURRENCY")? {
            config.concurrency = concurrency;
        }
        if let Some(ms) = env_parse::<u64>("COURIER_MESSAGE_TTL_MS")? {
            config.message_ttl = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("COURIER_DEDUP_WINDOW_SECS")? {
            config.dedup_window = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.trim().is_empty() {
            return Err(ConfigError::Invalid("queue name cannot be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency cannot be 0".into()));
        }
        if self.message_ttl.is_zero() {
            return Err(ConfigError::Invalid("message ttl cannot be 0".into()));
        }
        if self.reconnect_backoff > self.max_reconnect_backoff {
            return Err(ConfigError::Invalid(
                "reconnect backoff exceeds its maximum".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
