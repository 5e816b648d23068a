//! Authentication session and authenticated event delivery.
//!
//! [`AuthManager`] owns the current [`AuthSession`], persists it under the
//! `session` storage key, and hands out access tokens, refreshing them
//! shortly before they expire. [`DeliveryClient`] combines the manager with
//! the [`BackendClient`] and is the [`EventSink`] the queue delivers through.
//!
//! Tokens are zeroized when a session is dropped and never appear in `Debug`
//! output or logs.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::client::{BackendClient, ClientError, TokenResponse};
use crate::queue::EventSink;
use crate::storage::{Storage, StorageError, SESSION_KEY};
use crate::types::{ActivitySummary, Event};

/// Access tokens expiring within this many seconds are refreshed first.
const REFRESH_SKEW_SECS: i64 = 60;

/// Errors from login and logout.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Email or password was empty.
    #[error("email and password are required")]
    MissingCredentials,

    /// The backend rejected the credentials.
    #[error("invalid email or password")]
    InvalidCredentials,

    /// Backend request failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The session could not be persisted.
    #[error("session storage error: {0}")]
    Storage(#[from] StorageError),
}

/// An authenticated session.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    email: String,
}

impl AuthSession {
    /// Builds a session from a login or refresh response.
    #[must_use]
    pub fn from_tokens(mut tokens: TokenResponse) -> Self {
        let lifetime = i64::try_from(tokens.expires_in).unwrap_or(i64::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ChronoDuration::seconds(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            access_token: std::mem::take(&mut tokens.access_token),
            refresh_token: std::mem::take(&mut tokens.refresh_token),
            expires_at,
            email: std::mem::take(&mut tokens.email),
        }
    }

    /// Account email.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    /// When the access token expires.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns true if the access token expires within the refresh skew.
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= ChronoDuration::seconds(REFRESH_SKEW_SECS)
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("email", &self.email)
            .finish()
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.access_token.zeroize();
        self.refresh_token.zeroize();
    }
}

/// Session summary for status responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub authenticated: bool,
    pub email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Owns the current session and keeps its access token fresh.
///
/// The session lock is held across refresh requests so concurrent callers
/// share a single refresh.
#[derive(Debug)]
pub struct AuthManager {
    client: BackendClient,
    storage: Storage,
    session: Mutex<Option<AuthSession>>,
}

impl AuthManager {
    /// Creates a manager, restoring any persisted session.
    ///
    /// A corrupt session document is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the session document cannot be read.
    pub fn new(client: BackendClient, storage: Storage) -> Result<Self, StorageError> {
        let session = match storage.get::<AuthSession>(SESSION_KEY) {
            Ok(session) => session,
            Err(StorageError::Corrupt { source, .. }) => {
                warn!(error = %source, "Stored session is corrupt, discarding");
                storage.remove(SESSION_KEY)?;
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(session) = &session {
            info!(email = %session.email, "Restored session");
        }

        Ok(Self {
            client,
            storage,
            session: Mutex::new(session),
        })
    }

    /// Logs in and persists the new session. Returns the account email.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] when the backend rejects the
    /// credentials, or the underlying client/storage error.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, AuthError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let tokens = self.client.login(email, password).await.map_err(|e| match e {
            ClientError::Unauthorized => AuthError::InvalidCredentials,
            other => AuthError::Client(other),
        })?;

        let session = AuthSession::from_tokens(tokens);
        let account = session.email.clone();

        let mut guard = self.session.lock().await;
        self.storage.set(SESSION_KEY, &session)?;
        *guard = Some(session);

        info!(email = %account, "Logged in");
        Ok(account)
    }

    /// Ends the session. The backend is notified on a best-effort basis; the
    /// local session is always cleared.
    ///
    /// Returns `false` if there was no session.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored session cannot be removed.
    pub async fn logout(&self) -> Result<bool, AuthError> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            return Ok(false);
        };

        if let Err(e) = self.client.logout(&session.access_token).await {
            warn!(error = %e, "Backend logout failed, clearing local session anyway");
        }
        self.storage.remove(SESSION_KEY)?;

        info!(email = %session.email, "Logged out");
        Ok(true)
    }

    /// Returns true if a session is present.
    pub async fn is_authenticated(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Email of the logged-in account.
    pub async fn email(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.email.clone())
    }

    /// Session summary.
    pub async fn status(&self) -> AuthStatus {
        let guard = self.session.lock().await;
        AuthStatus {
            authenticated: guard.is_some(),
            email: guard.as_ref().map(|s| s.email.clone()),
            expires_at: guard.as_ref().map(AuthSession::expires_at),
        }
    }

    /// Returns a usable access token, refreshing it first when it is about to
    /// expire.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotAuthenticated`] without a session and
    /// [`ClientError::Unauthorized`] if the refresh token was rejected (the
    /// session is cleared in that case).
    pub async fn access_token(&self) -> Result<String, ClientError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ClientError::NotAuthenticated)?;

        if !session.needs_refresh(Utc::now()) {
            return Ok(session.access_token.clone());
        }

        debug!("Access token near expiry");
        self.refresh_locked(&mut guard).await
    }

    /// Refreshes the session regardless of expiry, e.g. after a 401.
    ///
    /// # Errors
    ///
    /// Same as [`access_token`](Self::access_token).
    pub async fn force_refresh(&self) -> Result<String, ClientError> {
        let mut guard = self.session.lock().await;
        self.refresh_locked(&mut guard).await
    }

    /// Reads the account's activity summary from the backend, refreshing and
    /// retrying once on a 401.
    ///
    /// # Errors
    ///
    /// Same as [`access_token`](Self::access_token), plus request failures.
    pub async fn activity(&self) -> Result<ActivitySummary, ClientError> {
        let token = self.access_token().await?;
        match self.client.activity(&token).await {
            Err(ClientError::Unauthorized) => {
                let token = self.force_refresh().await?;
                self.client.activity(&token).await
            }
            result => result,
        }
    }

    async fn refresh_locked(&self, slot: &mut Option<AuthSession>) -> Result<String, ClientError> {
        let refresh_token = slot
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or(ClientError::NotAuthenticated)?;

        match self.client.refresh(&refresh_token).await {
            Ok(tokens) => {
                let session = AuthSession::from_tokens(tokens);
                let token = session.access_token.clone();
                if let Err(e) = self.storage.set(SESSION_KEY, &session) {
                    warn!(error = %e, "Failed to persist refreshed session");
                }
                *slot = Some(session);
                info!("Access token refreshed");
                Ok(token)
            }
            Err(ClientError::Unauthorized) => {
                warn!("Refresh token rejected, session cleared");
                *slot = None;
                if let Err(e) = self.storage.remove(SESSION_KEY) {
                    warn!(error = %e, "Failed to remove stored session");
                }
                Err(ClientError::Unauthorized)
            }
            Err(e) => Err(e),
        }
    }
}

/// Authenticated [`EventSink`]: attaches the access token and recovers once
/// from an expired token.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: BackendClient,
    auth: Arc<AuthManager>,
}

impl DeliveryClient {
    #[must_use]
    pub fn new(client: BackendClient, auth: Arc<AuthManager>) -> Self {
        Self { client, auth }
    }

    /// Delivers a batch, refreshing and retrying once on a 401.
    ///
    /// # Errors
    ///
    /// Returns the client error of the last attempt.
    pub async fn deliver(&self, events: &[Event]) -> Result<(), ClientError> {
        let token = self.auth.access_token().await?;
        match self.client.send_events(&token, events).await {
            Err(ClientError::Unauthorized) => {
                debug!("Events rejected with 401, refreshing token");
                let token = self.auth.force_refresh().await?;
                self.client.send_events(&token, events).await
            }
            result => result,
        }
    }
}

impl EventSink for DeliveryClient {
    fn send_events<'a>(&'a self, events: &'a [Event]) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(self.deliver(events))
    }
}
