//! Error types for the TabPulse agent.
//!
//! Each module owns a focused error enum; [`AgentError`] gathers them for
//! callers that drive several subsystems at once, such as the binary's
//! startup path.

use thiserror::Error;

use crate::auth::AuthError;
use crate::client::ClientError;
use crate::config::ConfigError;
use crate::controller::ControllerError;
use crate::messaging::MessageError;
use crate::router::RouterError;
use crate::settings::SettingsError;
use crate::storage::StorageError;
use crate::watcher::WatcherError;

/// Errors that can occur during agent operations.
///
/// # Examples
///
/// ```ignore
/// use tabpulse_agent::error::AgentError;
///
/// fn open_store() -> Result<Storage, AgentError> {
///     let dir = tabpulse_agent::config::data_dir_from_env()?;
///     Ok(Storage::open(dir)?)
/// }
/// ```
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Settings mutation failed.
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Backend request error.
    #[error("backend error: {0}")]
    Client(#[from] ClientError),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Native messaging framing error.
    #[error("messaging error: {0}")]
    Messaging(#[from] MessageError),

    #[error("request error: {0}")]
    Router(#[from] RouterError),

    #[error("tracking error: {0}")]
    Controller(#[from] ControllerError),

    /// Settings file watcher error.
    #[error("file watch error: {0}")]
    Watch(#[from] WatcherError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
