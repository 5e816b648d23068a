//! HTTP client for the TabPulse backend.
//!
//! This module wraps the backend API:
//!
//! - `POST /events` delivers a batch with a bearer access token
//! - `POST /auth/login`, `POST /auth/refresh` and `POST /auth/logout`
//!   manage the session
//! - `GET /activity` reads the signed-in user's per-domain totals
//!
//! The client makes exactly one request per call. Retry and backoff are the
//! queue's responsibility; the client only classifies failures.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::types::{ActivitySummary, Event};

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Retry-After value assumed when a 429 carries no usable header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Maximum length of an error body kept in [`ClientError::Status`].
const MAX_ERROR_BODY_LEN: usize = 200;

/// Errors returned by the backend client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The request could not be sent or the response not read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend rejected the credentials or token (401).
    #[error("unauthorized")]
    Unauthorized,

    /// The backend is rate limiting this client (429).
    #[error("rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// Any other non-2xx response.
    #[error("server error: {status} - {message}")]
    Status { status: u16, message: String },

    /// No session is available to authenticate the request.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The response body could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns true if the same request may succeed later without user action.
    ///
    /// Every failure still counts towards the queue's failure threshold; this
    /// only feeds diagnostics.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::RateLimited { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408,
            Self::Unauthorized | Self::NotAuthenticated | Self::Json(_) => false,
        }
    }

    /// Minimum wait the server asked for, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

/// Tokens returned by login and refresh.
#[derive(Clone, Deserialize)]
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

impl Drop for TokenResponse {
    fn drop(&mut self) {
        self.access_token.zeroize();
        self.refresh_token.zeroize();
    }
}

#[derive(Serialize)]
struct EventBatch<'a> {
    events: &'a [Event],
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Thin client over the backend HTTP API.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    http: Client,
}

impl BackendClient {
    /// Creates a client for the API at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Returns the API base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Delivers a batch of events.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures and any non-2xx response.
    pub async fn send_events(&self, access_token: &str, events: &[Event]) -> Result<(), ClientError> {
        let url = self.url("/events");
        debug!(url = %url, events = events.len(), "Sending event batch");

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&EventBatch { events })
            .send()
            .await?;

        check_status(response).await.map(drop)
    }

    /// Exchanges credentials for a session.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unauthorized`] for bad credentials.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenResponse, ClientError> {
        debug!(email = %email, "Logging in");
        let response = self
            .http
            .post(self.url("/auth/login"))
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        parse_tokens(check_status(response).await?).await
    }

    /// Exchanges a refresh token for a new session.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unauthorized`] if the refresh token is no longer valid.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ClientError> {
        debug!("Refreshing access token");
        let response = self
            .http
            .post(self.url("/auth/refresh"))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        parse_tokens(check_status(response).await?).await
    }

    /// Revokes the session on the backend.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures and non-2xx responses.
    pub async fn logout(&self, access_token: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/auth/logout"))
            .bearer_auth(access_token)
            .send()
            .await?;

        check_status(response).await.map(drop)
    }

    /// Fetches the per-domain activity summary for the token's user.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unauthorized`] if the token has expired.
    pub async fn activity(&self, access_token: &str) -> Result<ActivitySummary, ClientError> {
        let response = self
            .http
            .get(self.url("/activity"))
            .bearer_auth(access_token)
            .send()
            .await?;

        let bytes = check_status(response).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_secs = parse_retry_after(&response);
            warn!(retry_after_secs, "Rate limited by backend");
            Err(ClientError::RateLimited { retry_after_secs })
        }
        _ => {
            let mut message = response.text().await.unwrap_or_default();
            if message.len() > MAX_ERROR_BODY_LEN {
                let mut end = MAX_ERROR_BODY_LEN;
                while !message.is_char_boundary(end) {
                    end -= 1;
                }
                message.truncate(end);
            }
            Err(ClientError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn parse_retry_after(response: &Response) -> u64 {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

async fn parse_tokens(response: Response) -> Result<TokenResponse, ClientError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
