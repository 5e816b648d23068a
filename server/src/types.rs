//! Wire types for the TabPulse server.
//!
//! Request and response bodies use camelCase JSON, matching what the agent
//! sends. Incoming events are validated into [`Event`] before they reach the
//! activity store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a domain gained or lost the user's attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Active,
    Inactive,
}

/// An event as received, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingEvent {
    pub event_type: EventType,
    pub domain: String,
    /// RFC 3339 timestamp; parsed during validation.
    pub timestamp: String,
}

/// A validated tab activity event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: EventType,
    pub domain: String,
    pub timestamp: DateTime<Utc>,
}

/// Why an incoming event was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRejection {
    EmptyDomain,
    InvalidTimestamp(String),
}

impl std::fmt::Display for EventRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDomain => write!(f, "domain is empty"),
            Self::InvalidTimestamp(raw) => write!(f, "invalid timestamp '{raw}'"),
        }
    }
}

impl TryFrom<IncomingEvent> for Event {
    type Error = EventRejection;

    fn try_from(incoming: IncomingEvent) -> Result<Self, Self::Error> {
        let domain = incoming.domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            return Err(EventRejection::EmptyDomain);
        }

        let timestamp = DateTime::parse_from_rfc3339(incoming.timestamp.trim())
            .map_err(|_| EventRejection::InvalidTimestamp(incoming.timestamp.clone()))?
            .with_timezone(&Utc);

        Ok(Self {
            event_type: incoming.event_type,
            domain,
            timestamp,
        })
    }
}

/// Body of `POST /events`.
#[derive(Debug, Deserialize)]
pub struct EventBatch {
    pub events: Vec<IncomingEvent>,
}

/// Body of `POST /auth/login`.
#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Tokens returned by login and refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub email: String,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("email", &self.email)
            .finish()
    }
}

/// Response of `POST /events`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub accepted: usize,
}

/// Per-domain activity totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainActivity {
    pub domain: String,
    pub active_count: u64,
    pub inactive_count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Response of `GET /activity`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    pub email: String,
    pub total_events: u64,
    pub domains: Vec<DomainActivity>,
}
