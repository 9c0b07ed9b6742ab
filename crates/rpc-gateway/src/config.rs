//! Client configuration with validation.

use serde::{Deserialize, Serialize};
use shared_bus::{QueueOptions, DEFAULT_MESSAGE_TTL};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default deadline for a call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Default reply queue name prefix. The full name is `<prefix>.<uuid>`.
pub const DEFAULT_REPLY_QUEUE_PREFIX: &str = "courier.reply";

/// RPC client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcClientConfig {
    /// Deadline applied when a call passes no explicit timeout
    #[serde(with = "shared_types::duration_str")]
    pub default_timeout: Duration,
    /// Prefix of this client's private reply queue
    pub reply_queue_prefix: String,
    /// Options used when declaring a worker queue before the first publish.
    /// Must match what the worker declares.
    pub work_queue: QueueOptions,
    /// How often the registry is swept for abandoned calls
    #[serde(with = "shared_types::duration_str")]
    pub sweep_interval: Duration,
    /// First delay before re-consuming the reply queue after connection loss
    #[serde(with = "shared_types::duration_str")]
    pub reconnect_backoff: Duration,
    /// Upper bound for the reconnect delay
    #[serde(with = "shared_types::duration_str")]
    pub max_reconnect_backoff: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_RPC_TIMEOUT,
            reply_queue_prefix: DEFAULT_REPLY_QUEUE_PREFIX.to_string(),
            work_queue: QueueOptions::work_queue(DEFAULT_MESSAGE_TTL),
            sweep_interval: Duration::from_secs(1),
            reconnect_backoff: Duration::from_millis(100),
            max_reconnect_backoff: Duration::from_secs(5),
        }
    }
}

impl RpcClientConfig {
    /// Build from `COURIER_*` environment variables, falling back to defaults.
    ///
    /// - `COURIER_RPC_TIMEOUT_MS`
    /// - `COURIER_MESSAGE_TTL_MS`
    /// - `COURIER_REPLY_QUEUE_PREFIX`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = env_millis("COURIER_RPC_TIMEOUT_MS")? {
            config.default_timeout = ms;
        }
        if let Some(ttl) = env_millis("COURIER_MESSAGE_TTL_MS")? {
            config.work_queue = QueueOptions::work_queue(ttl);
        }
        if let Ok(prefix) = env::var("COURIER_REPLY_QUEUE_PREFIX") {
            config.reply_queue_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "default timeout cannot be 0".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "sweep interval cannot be 0".into(),
            ));
        }
        if self.reconnect_backoff > self.max_reconnect_backoff {
            return Err(ConfigError::InvalidTimeout(
                "reconnect backoff exceeds its maximum".into(),
            ));
        }
        if self.reply_queue_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "reply queue prefix cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Environment variable present but unparsable
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Read an integer millisecond value from the environment.
pub fn env_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
