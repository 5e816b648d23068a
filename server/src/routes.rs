//! HTTP route handlers for the TabPulse server.
//!
//! - `POST /auth/login` - Exchange email and password for a token pair
//! - `POST /auth/refresh` - Rotate a token pair
//! - `POST /auth/logout` - Revoke the caller's tokens
//! - `POST /events` - Ingest a batch of tab activity events
//! - `GET /activity` - Per-domain totals for the caller
//! - `GET /health` - Health check
//!
//! # Example
//!
//! ```rust,no_run
//! use tabpulse_server::config::Config;
//! use tabpulse_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = AppState::new(Config::from_env()?);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::activity::ActivityStore;
use crate::auth::{Authenticated, UserDirectory};
use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::rate_limit::{Decision, RateLimiter};
use crate::session::{SessionError, TokenStore, TokenStoreConfig};
use crate::types::{
    ActivityResponse, Event, EventBatch, IngestResponse, LoginRequest, RefreshRequest,
    TokenResponse,
};

/// Maximum request body size (1 MiB).
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Maximum number of events in one batch.
pub const MAX_EVENTS_PER_BATCH: usize = 1000;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub users: Arc<UserDirectory>,
    pub tokens: Arc<TokenStore>,
    pub activity: ActivityStore,
    pub rate_limiter: RateLimiter,
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_rate_limiter(config, RateLimiter::default())
    }

    /// Creates state with a custom rate limiter.
    #[must_use]
    pub fn with_rate_limiter(config: Config, rate_limiter: RateLimiter) -> Self {
        Self {
            users: Arc::new(UserDirectory::from_config(&config)),
            tokens: Arc::new(TokenStore::new(TokenStoreConfig::from(&config))),
            config: Arc::new(config),
            activity: ActivityStore::new(),
            rate_limiter,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("users", &self.users)
            .field("tokens", &self.tokens)
            .field("rate_limiter", &self.rate_limiter)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/login", post(post_login))
        .route("/auth/refresh", post(post_refresh))
        .route("/auth/logout", post(post_logout))
        .route("/events", post(post_events))
        .route("/activity", get(get_activity))
        .route("/health", get(get_health))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Parses a JSON body, turning serde errors into `invalid_format`.
fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|err| {
        debug!(error = %err, "Failed to parse request body");
        ServerError::validation("invalid_format", format!("invalid request body: {err}"))
    })
}

fn capacity_error(err: SessionError) -> ServerError {
    warn!(error = %err, "Unable to issue tokens");
    ServerError::internal(err.to_string())
}

// ============================================================================
// Auth
// ============================================================================

/// POST /auth/login
///
/// - `200 OK` with a [`TokenResponse`]
/// - `400 Bad Request` for a malformed body
/// - `401 Unauthorized` with code `invalid_credentials`
async fn post_login(State(state): State<AppState>, body: Bytes) -> Result<Json<TokenResponse>> {
    let request: LoginRequest = parse_json(&body)?;
    let email = state.users.verify(&request.email, &request.password)?;
    let tokens = state.tokens.issue(&email).map_err(capacity_error)?;

    info!(email = %email, "User logged in");
    Ok(Json(tokens))
}

/// POST /auth/refresh
///
/// Refresh tokens are single use; the response carries a new pair.
async fn post_refresh(State(state): State<AppState>, body: Bytes) -> Result<Json<TokenResponse>> {
    let request: RefreshRequest = parse_json(&body)?;
    let tokens = state
        .tokens
        .refresh(&request.refresh_token)
        .map_err(|err| match err {
            SessionError::NotFound => ServerError::auth("invalid or expired refresh token"),
            other => capacity_error(other),
        })?;

    debug!(email = %tokens.email, "Token pair rotated");
    Ok(Json(tokens))
}

/// POST /auth/logout
///
/// Always `204 No Content` for an authenticated caller.
async fn post_logout(State(state): State<AppState>, caller: Authenticated) -> StatusCode {
    if let Some(token) = caller.token.as_deref() {
        state.tokens.revoke(token);
        state.rate_limiter.forget(token);
    }
    info!(email = %caller.email, "User logged out");
    StatusCode::NO_CONTENT
}

// ============================================================================
// POST /events - Event Ingestion
// ============================================================================

/// POST /events
///
/// Body: `{"events": [{"eventType", "domain", "timestamp"}, ...]}`.
/// The whole batch is rejected if any event is invalid.
///
/// - `202 Accepted` with an [`IngestResponse`]
/// - `400 Bad Request` - malformed body, too many events, or an invalid event
/// - `401 Unauthorized` - missing or expired access token
/// - `413 Payload Too Large` - body over [`MAX_BODY_SIZE`]
/// - `429 Too Many Requests` - rate limit exceeded, with `Retry-After`
async fn post_events(
    State(state): State<AppState>,
    caller: Authenticated,
    body: Bytes,
) -> Result<impl IntoResponse> {
    if let Decision::Limited { retry_after_secs } = state.rate_limiter.check(caller.rate_key()) {
        info!(
            email = %caller.email,
            retry_after = retry_after_secs,
            "Rate limit exceeded"
        );
        return Err(ServerError::RateLimit {
            retry_after: retry_after_secs,
        });
    }

    let batch: EventBatch = parse_json(&body)?;
    if batch.events.len() > MAX_EVENTS_PER_BATCH {
        return Err(ServerError::validation(
            "too_many_events",
            format!(
                "batch has {} events, the limit is {MAX_EVENTS_PER_BATCH}",
                batch.events.len()
            ),
        ));
    }

    let events = batch
        .events
        .into_iter()
        .enumerate()
        .map(|(index, incoming)| {
            Event::try_from(incoming).map_err(|rejection| {
                debug!(email = %caller.email, index, reason = %rejection, "Rejected event");
                ServerError::validation("invalid_event", format!("event {index}: {rejection}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    state.activity.record(&caller.email, &events);
    info!(email = %caller.email, event_count = events.len(), "Events accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted: events.len(),
        }),
    ))
}

// ============================================================================
// GET /activity
// ============================================================================

async fn get_activity(State(state): State<AppState>, caller: Authenticated) -> Json<ActivityResponse> {
    Json(state.activity.summary(&caller.email))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for the health check.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub stored_events: u64,
    pub active_sessions: usize,
}

/// GET /health - no authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        stored_events: state.activity.total_events(),
        active_sessions: state.tokens.len(),
    })
}

// ============================================================================
// Tests
// ============================================================================
