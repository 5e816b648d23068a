//! Credential checks and bearer token authentication.
//!
//! Users are configured through `TABPULSE_USERS`. Passwords are compared in
//! constant time with [`subtle`]. Authenticated routes take an
//! [`Authenticated`] extractor, which resolves the `Authorization: Bearer`
//! header against the [`TokenStore`](crate::session::TokenStore).
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use tabpulse_server::auth::{AuthError, UserDirectory};
//!
//! let mut users = HashMap::new();
//! users.insert("ada@example.com".to_string(), "hunter2".to_string());
//! let directory = UserDirectory::new(users);
//!
//! assert_eq!(directory.verify("Ada@Example.com", "hunter2").unwrap(), "ada@example.com");
//! assert_eq!(directory.verify("ada@example.com", "wrong"), Err(AuthError::InvalidCredentials));
//! ```

use std::collections::HashMap;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::ServerError;
use crate::routes::AppState;

/// Identity used for requests when authentication is disabled.
pub const ANONYMOUS: &str = "anonymous";

/// Errors that can occur while authenticating a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Email and password did not match a configured user.
    #[error("invalid email or password")]
    InvalidCredentials,

    /// The request carried no `Authorization` header.
    #[error("missing bearer token")]
    MissingToken,

    /// The `Authorization` header is not `Bearer <token>`.
    #[error("malformed authorization header")]
    MalformedHeader,

    /// The token is unknown or expired.
    #[error("invalid or expired token")]
    InvalidToken,
}

impl AuthError {
    /// Returns `true` if this error came from a login attempt.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, Self::InvalidCredentials)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => ServerError::InvalidCredentials,
            other => ServerError::auth(other.to_string()),
        }
    }
}

/// Configured users and their passwords.
pub struct UserDirectory {
    users: HashMap<String, String>,
    accept_any: bool,
}

impl UserDirectory {
    /// Creates a directory from `email -> password` pairs.
    ///
    /// Emails are matched case-insensitively.
    pub fn new(users: HashMap<String, String>) -> Self {
        let users = users
            .into_iter()
            .map(|(email, password)| (email.to_ascii_lowercase(), password))
            .collect();
        Self {
            users,
            accept_any: false,
        }
    }

    /// Builds the directory for a server configuration.
    ///
    /// With `unsafe_no_auth`, any non-empty email and password are accepted.
    pub fn from_config(config: &Config) -> Self {
        Self {
            accept_any: config.unsafe_no_auth,
            ..Self::new(config.users.clone())
        }
    }

    /// Checks a login attempt and returns the normalized email.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] for unknown users and wrong
    /// passwords alike.
    pub fn verify(&self, email: &str, password: &str) -> Result<String, AuthError> {
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        if self.accept_any {
            trace!(email = %email, "Accepting login without password check");
            return Ok(email);
        }

        let Some(expected) = self.users.get(&email) else {
            debug!(email = %email, "Login for unknown user");
            return Err(AuthError::InvalidCredentials);
        };

        if bool::from(expected.as_bytes().ct_eq(password.as_bytes())) {
            Ok(email)
        } else {
            debug!(email = %email, "Login with wrong password");
            Err(AuthError::InvalidCredentials)
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl std::fmt::Debug for UserDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDirectory")
            .field("user_count", &self.users.len())
            .field("accept_any", &self.accept_any)
            .finish()
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
///
/// # Errors
///
/// Returns [`AuthError::MissingToken`] when the header is absent and
/// [`AuthError::MalformedHeader`] when it is not a non-empty bearer token.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers.get(AUTHORIZATION).ok_or(AuthError::MissingToken)?;
    let value = value.to_str().map_err(|_| AuthError::MalformedHeader)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MalformedHeader)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

/// The caller of an authenticated route.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub email: String,
    /// The access token presented, absent for anonymous callers.
    pub token: Option<String>,
}

impl Authenticated {
    /// Key used to rate limit this caller.
    pub fn rate_key(&self) -> &str {
        self.token.as_deref().unwrap_or(&self.email)
    }
}

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = match bearer_token(&parts.headers) {
            Ok(token) => Some(token),
            Err(_) if state.config.unsafe_no_auth => None,
            Err(err) => {
                debug!(error = %err, "Rejecting request without usable token");
                return Err(err.into());
            }
        };

        if let Some(token) = token {
            if let Some(email) = state.tokens.validate_access(token) {
                return Ok(Self {
                    email,
                    token: Some(token.to_string()),
                });
            }
            if !state.config.unsafe_no_auth {
                debug!("Rejecting unknown or expired access token");
                return Err(AuthError::InvalidToken.into());
            }
        }

        Ok(Self {
            email: ANONYMOUS.to_string(),
            token: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn directory() -> UserDirectory {
        let mut users = HashMap::new();
        users.insert("Ada@Example.com".to_string(), "hunter2".to_string());
        users.insert("bob@example.com".to_string(), "correct horse".to_string());
        UserDirectory::new(users)
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn verify_accepts_correct_password() {
        assert_eq!(directory().verify("ada@example.com", "hunter2").unwrap(), "ada@example.com");
        assert_eq!(
            directory().verify(" BOB@example.com ", "correct horse").unwrap(),
            "bob@example.com"
        );
    }

    #[test]
    fn verify_rejects_wrong_password() {
        assert_eq!(
            directory().verify("ada@example.com", "hunter3"),
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            directory().verify("ada@example.com", "hunter22"),
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn verify_rejects_unknown_user_with_same_error() {
        assert_eq!(
            directory().verify("eve@example.com", "hunter2"),
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn verify_rejects_empty_credentials() {
        assert!(directory().verify("", "hunter2").is_err());
        assert!(directory().verify("ada@example.com", "").is_err());
    }

    #[test]
    fn unsafe_directory_accepts_any_non_empty_login() {
        let config = Config {
            unsafe_no_auth: true,
            ..Config::default()
        };
        let directory = UserDirectory::from_config(&config);

        assert_eq!(directory.verify("Dev@Local", "x").unwrap(), "dev@local");
        assert!(directory.verify("dev@local", "").is_err());
    }

    #[test]
    fn directory_debug_hides_passwords() {
        let debug = format!("{:?}", directory());
        assert!(debug.contains("user_count: 2"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn bearer_token_extracts_token() {
        assert_eq!(bearer_token(&headers_with("Bearer abc123")), Ok("abc123"));
        assert_eq!(bearer_token(&headers_with("bearer  abc123 ")), Ok("abc123"));
    }

    #[test]
    fn bearer_token_rejects_bad_headers() {
        assert_eq!(bearer_token(&HeaderMap::new()), Err(AuthError::MissingToken));
        assert_eq!(bearer_token(&headers_with("Basic abc123")), Err(AuthError::MalformedHeader));
        assert_eq!(bearer_token(&headers_with("Bearer")), Err(AuthError::MalformedHeader));
        assert_eq!(bearer_token(&headers_with("Bearer   ")), Err(AuthError::MalformedHeader));
    }

    #[test]
    fn auth_errors_map_to_server_errors() {
        assert!(matches!(
            ServerError::from(AuthError::InvalidCredentials),
            ServerError::InvalidCredentials
        ));
        assert!(matches!(
            ServerError::from(AuthError::InvalidToken),
            ServerError::Auth(_)
        ));
        assert!(AuthError::InvalidCredentials.is_credential_error());
        assert!(!AuthError::MissingToken.is_credential_error());
    }

    #[test]
    fn rate_key_prefers_token() {
        let caller = Authenticated {
            email: "ada@example.com".to_string(),
            token: Some("tok".to_string()),
        };
        assert_eq!(caller.rate_key(), "tok");

        let anonymous = Authenticated {
            email: ANONYMOUS.to_string(),
            token: None,
        };
        assert_eq!(anonymous.rate_key(), ANONYMOUS);
    }
}
