//! Configuration module for the TabPulse agent.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TABPULSE_API_URL` | Yes | - | Backend base URL (e.g., `https://api.tabpulse.dev`) |
//! | `TABPULSE_DATA_DIR` | No | platform data dir | Directory for settings, queue and session |
//! | `TABPULSE_DEVICE_ID` | No | hostname | Label for this browser profile |
//! | `TABPULSE_BATCH_SIZE` | No | 50 | Events sent per flush |
//! | `TABPULSE_FLUSH_INTERVAL_SECS` | No | 30 | Seconds between periodic flushes |
//! | `TABPULSE_RETRY_DELAY_SECS` | No | 20 | Seconds before retrying a failed flush |
//! | `TABPULSE_MAX_QUEUE_SIZE` | No | 1000 | Queue capacity (at least the batch size) |
//! | `TABPULSE_MAX_FAILURES` | No | 5 | Consecutive failures before tracking is disabled (1-100) |
//!
//! # Example
//!
//! ```no_run
//! use tabpulse_agent::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("API URL: {}", config.api_url);
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

use crate::queue::{
    QueueConfig, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_FAILURES,
    DEFAULT_MAX_QUEUE_SIZE, DEFAULT_RETRY_DELAY,
};

/// Minimum allowed failure threshold.
const MIN_MAX_FAILURES: u32 = 1;

/// Maximum allowed failure threshold.
const MAX_MAX_FAILURES: u32 = 100;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine the platform data directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Configuration for the TabPulse agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend base URL, without a trailing slash.
    pub api_url: String,

    /// Directory holding `settings.json`, `event_queue.json` and `session.json`.
    pub data_dir: PathBuf,

    /// Label for this browser profile in logs and status output.
    pub device_id: String,

    /// Queue tuning.
    pub queue: QueueConfig,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `TABPULSE_API_URL` is not set or is not an http(s) URL
    /// - A numeric variable is set but cannot be parsed or is out of range
    /// - `TABPULSE_MAX_QUEUE_SIZE` is smaller than `TABPULSE_BATCH_SIZE`
    /// - The data directory cannot be determined
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = env::var("TABPULSE_API_URL")
            .map_err(|_| ConfigError::MissingEnvVar("TABPULSE_API_URL".to_string()))?;
        let api_url = parse_api_url(&api_url)?;

        let data_dir = data_dir_from_env()?;
        let device_id = env::var("TABPULSE_DEVICE_ID").unwrap_or_else(|_| get_hostname());
        let queue = queue_config_from_env()?;

        Ok(Self {
            api_url,
            data_dir,
            device_id,
            queue,
        })
    }
}

/// Resolves the storage directory without requiring the rest of the config.
///
/// Used by CLI commands that only touch local state.
///
/// # Errors
///
/// Returns [`ConfigError::NoHomeDirectory`] if no platform data directory
/// exists and `TABPULSE_DATA_DIR` is unset.
pub fn data_dir_from_env() -> Result<PathBuf, ConfigError> {
    match env::var("TABPULSE_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
        _ => default_data_dir(),
    }
}

fn default_data_dir() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("dev", "tabpulse", "tabpulse")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDirectory)
}

fn queue_config_from_env() -> Result<QueueConfig, ConfigError> {
    let batch_size = parse_positive("TABPULSE_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;

    let flush_interval = parse_positive(
        "TABPULSE_FLUSH_INTERVAL_SECS",
        DEFAULT_FLUSH_INTERVAL.as_secs(),
    )
    .map(Duration::from_secs)?;

    let retry_delay = parse_positive("TABPULSE_RETRY_DELAY_SECS", DEFAULT_RETRY_DELAY.as_secs())
        .map(Duration::from_secs)?;

    let max_queue_size = parse_positive("TABPULSE_MAX_QUEUE_SIZE", DEFAULT_MAX_QUEUE_SIZE)?;
    if max_queue_size < batch_size {
        return Err(ConfigError::InvalidValue {
            key: "TABPULSE_MAX_QUEUE_SIZE".to_string(),
            message: format!(
                "queue size must be at least the batch size ({batch_size}), got {max_queue_size}"
            ),
        });
    }

    let max_failures_before_disable = parse_positive("TABPULSE_MAX_FAILURES", DEFAULT_MAX_FAILURES)?;
    if !(MIN_MAX_FAILURES..=MAX_MAX_FAILURES).contains(&max_failures_before_disable) {
        return Err(ConfigError::InvalidValue {
            key: "TABPULSE_MAX_FAILURES".to_string(),
            message: format!(
                "failure threshold must be between {MIN_MAX_FAILURES} and {MAX_MAX_FAILURES}, got {max_failures_before_disable}"
            ),
        });
    }

    Ok(QueueConfig {
        batch_size,
        flush_interval,
        retry_delay,
        max_queue_size,
        max_failures_before_disable,
    })
}

fn parse_api_url(raw: &str) -> Result<String, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "TABPULSE_API_URL".to_string(),
        message,
    };

    let url = Url::parse(raw.trim()).map_err(|e| invalid(format!("{e}: '{raw}'")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("expected http or https URL, got '{raw}'")));
    }

    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Parses an optional positive integer, falling back to `default` when unset.
fn parse_positive<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let Ok(val) = env::var(key) else {
        return Ok(default);
    };

    let parsed = val
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected positive integer, got '{val}'"),
        })?;

    if parsed == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value must be greater than 0".to_string(),
        });
    }

    Ok(parsed)
}

/// Gets the system hostname, falling back to "unknown" if it cannot be determined.
fn get_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string())
}
