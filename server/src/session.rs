//! Access and refresh token store.
//!
//! Login issues a pair of opaque tokens: a short-lived access token sent as
//! `Authorization: Bearer` on every request, and a long-lived refresh token
//! the agent trades for a new pair when the access token expires. Each token
//! remembers its partner so refresh and logout retire both halves.
//!
//! # Token Format
//!
//! Tokens are 32 bytes of cryptographically secure random data, base64-url
//! encoded without padding, resulting in 43 character tokens.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tabpulse_server::session::{TokenStore, TokenStoreConfig};
//!
//! let store = TokenStore::new(TokenStoreConfig::default());
//! let tokens = store.issue("ada@example.com").expect("store has capacity");
//!
//! assert_eq!(store.validate_access(&tokens.access_token).as_deref(), Some("ada@example.com"));
//!
//! let rotated = store.refresh(&tokens.refresh_token).unwrap();
//! assert!(store.validate_access(&tokens.access_token).is_none());
//! assert!(store.validate_access(&rotated.access_token).is_some());
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::types::TokenResponse;

/// Default access token TTL (15 minutes).
const DEFAULT_ACCESS_TTL_SECS: u64 = 15 * 60;

/// Default refresh token TTL (30 days).
const DEFAULT_REFRESH_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Maximum number of live token pairs.
const DEFAULT_MAX_CAPACITY: usize = 10_000;

/// Size of the random token in bytes.
const TOKEN_BYTES: usize = 32;

/// Expected length of base64-url encoded token (43 characters).
const TOKEN_LENGTH: usize = 43;

/// Errors that can occur during token operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The store has reached maximum capacity.
    #[error("token store at maximum capacity ({max_capacity} sessions)")]
    AtCapacity { max_capacity: usize },

    /// The token was not found or has expired.
    #[error("token not found or expired")]
    NotFound,
}

/// Configuration for the token store.
#[derive(Debug, Clone)]
pub struct TokenStoreConfig {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub max_capacity: usize,
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self {
            access_ttl: Duration::from_secs(DEFAULT_ACCESS_TTL_SECS),
            refresh_ttl: Duration::from_secs(DEFAULT_REFRESH_TTL_SECS),
            max_capacity: DEFAULT_MAX_CAPACITY,
        }
    }
}

impl From<&Config> for TokenStoreConfig {
    fn from(config: &Config) -> Self {
        Self {
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            ..Self::default()
        }
    }
}

/// One half of an issued token pair.
#[derive(Debug, Clone)]
struct Grant {
    email: String,
    expires_at: Instant,
    /// The other token of the pair.
    partner: String,
}

impl Grant {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct Tokens {
    access: HashMap<String, Grant>,
    refresh: HashMap<String, Grant>,
}

/// Thread-safe in-memory token store.
pub struct TokenStore {
    tokens: RwLock<Tokens>,
    config: TokenStoreConfig,
}

impl TokenStore {
    pub fn new(config: TokenStoreConfig) -> Self {
        debug!(
            access_ttl_secs = config.access_ttl.as_secs(),
            refresh_ttl_secs = config.refresh_ttl.as_secs(),
            max_capacity = config.max_capacity,
            "Creating token store"
        );
        Self {
            tokens: RwLock::new(Tokens::default()),
            config,
        }
    }

    /// Issues a fresh token pair for `email`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AtCapacity`] if the store is full.
    pub fn issue(&self, email: &str) -> Result<TokenResponse, SessionError> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        if tokens.refresh.len() >= self.config.max_capacity {
            warn!(
                max_capacity = self.config.max_capacity,
                "Token store at capacity, rejecting login"
            );
            return Err(SessionError::AtCapacity {
                max_capacity: self.config.max_capacity,
            });
        }
        Ok(self.insert_pair(&mut tokens, email))
    }

    /// Returns the email an access token belongs to, if it is live.
    ///
    /// Expired tokens are removed on access.
    pub fn validate_access(&self, token: &str) -> Option<String> {
        if token.len() != TOKEN_LENGTH {
            trace!(token_len = token.len(), "Invalid token length");
            return None;
        }

        let now = Instant::now();
        {
            let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
            match tokens.access.get(token) {
                Some(grant) if !grant.is_expired(now) => return Some(grant.email.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.access.remove(token);
        trace!("Removed expired access token during validation");
        None
    }

    /// Trades a refresh token for a new pair, retiring the old one.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the refresh token is unknown,
    /// already used, or expired.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, SessionError> {
        if refresh_token.len() != TOKEN_LENGTH {
            return Err(SessionError::NotFound);
        }

        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let grant = tokens
            .refresh
            .remove(refresh_token)
            .ok_or(SessionError::NotFound)?;
        tokens.access.remove(&grant.partner);

        if grant.is_expired(Instant::now()) {
            debug!("Rejected expired refresh token");
            return Err(SessionError::NotFound);
        }

        trace!("Rotated token pair");
        Ok(self.insert_pair(&mut tokens, &grant.email))
    }

    /// Revokes an access token and its refresh partner.
    ///
    /// Returns `true` if the token was live.
    pub fn revoke(&self, access_token: &str) -> bool {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        match tokens.access.remove(access_token) {
            Some(grant) => {
                tokens.refresh.remove(&grant.partner);
                trace!("Token pair revoked");
                true
            }
            None => false,
        }
    }

    /// Number of live access tokens, possibly including expired ones not yet
    /// swept.
    pub fn len(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .access
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all expired access and refresh tokens.
    ///
    /// Returns the number of tokens removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let before = tokens.access.len() + tokens.refresh.len();

        tokens.access.retain(|_, grant| !grant.is_expired(now));
        tokens.refresh.retain(|_, grant| !grant.is_expired(now));

        let removed = before - (tokens.access.len() + tokens.refresh.len());
        if removed > 0 {
            debug!(
                removed_count = removed,
                remaining_access = tokens.access.len(),
                remaining_refresh = tokens.refresh.len(),
                "Cleaned up expired tokens"
            );
        }
        removed
    }

    fn insert_pair(&self, tokens: &mut Tokens, email: &str) -> TokenResponse {
        let access_token = generate_token();
        let refresh_token = generate_token();
        let now = Instant::now();

        tokens.access.insert(
            access_token.clone(),
            Grant {
                email: email.to_string(),
                expires_at: now + self.config.access_ttl,
                partner: refresh_token.clone(),
            },
        );
        tokens.refresh.insert(
            refresh_token.clone(),
            Grant {
                email: email.to_string(),
                expires_at: now + self.config.refresh_ttl,
                partner: access_token.clone(),
            },
        );

        TokenResponse {
            access_token,
            refresh_token,
            expires_in: self.config.access_ttl.as_secs(),
            email: email.to_string(),
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(TokenStoreConfig::default())
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (access, refresh) = self
            .tokens
            .read()
            .map(|t| (t.access.len(), t.refresh.len()))
            .unwrap_or((0, 0));
        f.debug_struct("TokenStore")
            .field("access_count", &access)
            .field("refresh_count", &refresh)
            .field("config", &self.config)
            .finish()
    }
}

/// Generates a 43-character base64-url token from 32 random bytes.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
