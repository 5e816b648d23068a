//! TabPulse Agent - native messaging host for tab activity tracking.
//!
//! The browser extension forwards tab, window and idle signals over native
//! messaging. The agent turns them into domain-level `active`/`inactive`
//! events, queues them on disk and delivers them in batches to the TabPulse
//! backend.
//!
//! # Privacy
//!
//! Only the registrable host of a page is ever recorded, never paths, query
//! strings or titles. Excluded domains are dropped at the queue boundary and
//! purged from the queue when an exclusion is added.
//!
//! # Modules
//!
//! - [`types`]: Event types sent to the backend
//! - [`domain`]: Domain normalization and the exclusion list
//! - [`storage`]: JSON document storage in the data directory
//! - [`settings`]: Persisted user settings
//! - [`tracker`]: Attention tracking across tabs, windows and idle state
//! - [`queue`]: Bounded, persisted event queue with batched delivery
//! - [`client`]: HTTP client for the backend API
//! - [`auth`]: Session management and authenticated delivery
//! - [`controller`]: Glue between tracker, queue, settings and session
//! - [`messaging`]: Native messaging framing
//! - [`router`]: Request dispatch for extension messages
//! - [`logs`]: In-memory log buffer exposed to the extension
//! - [`watcher`]: Reloads settings edited outside the agent
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for agent operations

pub mod auth;
pub mod client;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod logs;
pub mod messaging;
pub mod queue;
pub mod router;
pub mod settings;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod watcher;

pub use auth::{AuthError, AuthManager, AuthSession, AuthStatus, DeliveryClient};
pub use client::{BackendClient, ClientError, TokenResponse};
pub use config::{Config, ConfigError};
pub use controller::{AgentStatus, ControllerError, TrackingController};
pub use domain::{domain_from_url, normalize_domain, DomainError, ExclusionList};
pub use error::{AgentError, Result};
pub use logs::{LogBuffer, LogBufferLayer, LogEntry};
pub use messaging::{read_frame, read_message, write_message, MessageError, MAX_MESSAGE_SIZE};
pub use queue::{
    AddOutcome, EventSink, FlushOutcome, QueueConfig, QueueManager, QueueStats, TrackingSwitch,
};
pub use router::{Request, Response, Router, RouterError};
pub use settings::{ReloadOutcome, Settings, SettingsError, SharedSettings};
pub use storage::{Storage, StorageError};
pub use tracker::{DomainTransition, IdleState, TabTracker};
pub use types::{Event, EventType};
pub use watcher::{apply_settings_changes, SettingsChanged, SettingsWatcher, WatcherError};
