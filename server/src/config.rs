//! Server configuration module.
//!
//! Parses configuration from environment variables for the TabPulse server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TABPULSE_USERS` | Yes* | - | Format: `email1:password1,email2:password2` |
//! | `TABPULSE_ACCESS_TTL_SECS` | No | 900 | Access token lifetime |
//! | `TABPULSE_REFRESH_TTL_SECS` | No | 2592000 | Refresh token lifetime (30 days) |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `TABPULSE_UNSAFE_NO_AUTH` | No | false | Disable all authentication (dev only) |
//!
//! *Not required if `TABPULSE_UNSAFE_NO_AUTH=true`

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default access token lifetime (15 minutes).
const DEFAULT_ACCESS_TTL_SECS: u64 = 15 * 60;

/// Default refresh token lifetime (30 days).
const DEFAULT_REFRESH_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Map of account email (lowercase) to password.
    pub users: HashMap<String, String>,

    /// Lifetime of issued access tokens.
    pub access_ttl: Duration,

    /// Lifetime of issued refresh tokens.
    pub refresh_ttl: Duration,

    /// HTTP server port.
    pub port: u16,

    /// When true, disables all authentication (development only).
    pub unsafe_no_auth: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut emails: Vec<&String> = self.users.keys().collect();
        emails.sort();
        f.debug_struct("Config")
            .field("users", &emails)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("port", &self.port)
            .field("unsafe_no_auth", &self.unsafe_no_auth)
            .finish()
    }
}

impl Default for Config {
    /// Local development defaults: no users, auth enabled.
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            access_ttl: Duration::from_secs(DEFAULT_ACCESS_TTL_SECS),
            refresh_ttl: Duration::from_secs(DEFAULT_REFRESH_TTL_SECS),
            port: DEFAULT_PORT,
            unsafe_no_auth: false,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `TABPULSE_USERS` is missing or empty (when `TABPULSE_UNSAFE_NO_AUTH` is not true)
    /// - Environment variables have invalid format
    /// - Port number is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tabpulse_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let unsafe_no_auth = parse_bool_env("TABPULSE_UNSAFE_NO_AUTH");
        let port = parse_port()?;
        let users = parse_users()?;
        let access_ttl = parse_ttl("TABPULSE_ACCESS_TTL_SECS", DEFAULT_ACCESS_TTL_SECS)?;
        let refresh_ttl = parse_ttl("TABPULSE_REFRESH_TTL_SECS", DEFAULT_REFRESH_TTL_SECS)?;

        if refresh_ttl < access_ttl {
            return Err(ConfigError::InvalidFormat {
                var: "TABPULSE_REFRESH_TTL_SECS".to_string(),
                message: "must not be shorter than the access token lifetime".to_string(),
            });
        }

        let config = Self {
            users,
            access_ttl,
            refresh_ttl,
            port,
            unsafe_no_auth,
        };

        if !config.unsafe_no_auth && config.users.is_empty() {
            return Err(ConfigError::MissingEnvVar("TABPULSE_USERS".to_string()));
        }

        if config.unsafe_no_auth {
            warn!(
                "TABPULSE_UNSAFE_NO_AUTH is enabled - all authentication is disabled. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive).
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a positive number of seconds.
fn parse_ttl(var: &str, default: u64) -> Result<Duration, ConfigError> {
    let Ok(raw) = env::var(var) else {
        return Ok(Duration::from_secs(default));
    };

    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidFormat {
            var: var.to_string(),
            message: format!("expected a positive number of seconds, got '{raw}'"),
        }),
    }
}

/// Parse the TABPULSE_USERS environment variable.
///
/// Expected format: `email1:password1,email2:password2`. The password is
/// everything after the first colon. Emails are matched case-insensitively.
fn parse_users() -> Result<HashMap<String, String>, ConfigError> {
    let users_str = match env::var("TABPULSE_USERS") {
        Ok(s) if !s.is_empty() => s,
        _ => return Ok(HashMap::new()),
    };

    let mut users = HashMap::new();

    for pair in users_str.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let Some((email, password)) = pair.split_once(':') else {
            return Err(ConfigError::InvalidFormat {
                var: "TABPULSE_USERS".to_string(),
                message: "expected 'email:password' entries".to_string(),
            });
        };

        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ConfigError::InvalidFormat {
                var: "TABPULSE_USERS".to_string(),
                message: format!("'{email}' is not an email address"),
            });
        }

        if password.is_empty() {
            return Err(ConfigError::InvalidFormat {
                var: "TABPULSE_USERS".to_string(),
                message: format!("empty password for '{email}'"),
            });
        }

        users.insert(email.to_ascii_lowercase(), password.to_string());
    }

    Ok(users)
}
