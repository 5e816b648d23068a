//! Extension message routing.
//!
//! Every message from the extension is a JSON object with a `type` tag and
//! an optional `id`. The [`Router`] decodes it into a [`Request`], hands it
//! to the first [`Handler`] that accepts it and wraps the result in a
//! [`Response`] carrying the same `id`:
//!
//! ```json
//! { "id": 7, "type": "addExcludedDomain", "domain": "example.com" }
//! { "id": 7, "ok": true, "data": { "domain": "example.com", "purged": 0 } }
//! ```
//!
//! Failures produce `ok: false` with an `error` message and a machine
//! readable `code`.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::auth::AuthError;
use crate::client::ClientError;
use crate::controller::{ControllerError, TrackingController};
use crate::logs::LogBuffer;
use crate::queue::FlushOutcome;
use crate::settings::SettingsError;
use crate::tracker::{IdleState, TabId, WindowId};

/// A password received from the extension. Redacted in `Debug` and zeroized
/// on drop.
#[derive(Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Messages understood by the agent.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    TabActivated {
        tab_id: TabId,
        window_id: WindowId,
        url: Option<String>,
    },
    TabUpdated {
        tab_id: TabId,
        url: String,
    },
    TabRemoved {
        tab_id: TabId,
    },
    WindowFocusChanged {
        /// `None` when no browser window has focus.
        window_id: Option<WindowId>,
    },
    IdleStateChanged {
        state: IdleState,
    },
    OnlineStatusChanged {
        online: bool,
    },
    GetStatus,
    GetSettings,
    SetTrackingEnabled {
        enabled: bool,
    },
    AddExcludedDomain {
        domain: String,
    },
    RemoveExcludedDomain {
        domain: String,
    },
    SetExcludedDomains {
        domains: Vec<String>,
    },
    Login {
        email: String,
        password: Password,
    },
    Logout,
    FlushNow,
    GetActivity,
    GetLogs {
        limit: Option<usize>,
    },
    ClearLogs,
}

impl Request {
    /// Wire name of the request type, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TabActivated { .. } => "tabActivated",
            Self::TabUpdated { .. } => "tabUpdated",
            Self::TabRemoved { .. } => "tabRemoved",
            Self::WindowFocusChanged { .. } => "windowFocusChanged",
            Self::IdleStateChanged { .. } => "idleStateChanged",
            Self::OnlineStatusChanged { .. } => "onlineStatusChanged",
            Self::GetStatus => "getStatus",
            Self::GetSettings => "getSettings",
            Self::SetTrackingEnabled { .. } => "setTrackingEnabled",
            Self::AddExcludedDomain { .. } => "addExcludedDomain",
            Self::RemoveExcludedDomain { .. } => "removeExcludedDomain",
            Self::SetExcludedDomains { .. } => "setExcludedDomains",
            Self::Login { .. } => "login",
            Self::Logout => "logout",
            Self::FlushNow => "flushNow",
            Self::GetActivity => "getActivity",
            Self::GetLogs { .. } => "getLogs",
            Self::ClearLogs => "clearLogs",
        }
    }
}

/// Reply to a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl Response {
    #[must_use]
    pub fn success(id: Value, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: (!data.is_null()).then_some(data),
            error: None,
            code: None,
        }
    }

    #[must_use]
    pub fn failure(id: Value, error: &RouterError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(error.to_string()),
            code: Some(error.code()),
        }
    }
}

/// Errors reported back to the extension.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The message is not a known request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No handler accepted the request.
    #[error("no handler for {0}")]
    Unhandled(&'static str),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// A backend read failed.
    #[error(transparent)]
    Backend(#[from] ClientError),
}

impl RouterError {
    /// Stable error code for the extension UI.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unhandled(_) => "unsupported",
            Self::Controller(e) => match e {
                ControllerError::NotAuthenticated => "not_authenticated",
                ControllerError::Settings(SettingsError::Domain(_)) => "invalid_domain",
                ControllerError::Settings(SettingsError::Storage(_))
                | ControllerError::Storage(_)
                | ControllerError::Auth(AuthError::Storage(_)) => "storage_error",
                ControllerError::Auth(AuthError::MissingCredentials) => "invalid_request",
                ControllerError::Auth(AuthError::InvalidCredentials) => "invalid_credentials",
                ControllerError::Auth(AuthError::Client(_)) => "backend_error",
            },
            Self::Backend(ClientError::Unauthorized | ClientError::NotAuthenticated) => {
                "not_authenticated"
            }
            Self::Backend(_) => "backend_error",
        }
    }
}

impl From<AuthError> for RouterError {
    fn from(e: AuthError) -> Self {
        Self::Controller(ControllerError::Auth(e))
    }
}

impl From<SettingsError> for RouterError {
    fn from(e: SettingsError) -> Self {
        Self::Controller(ControllerError::Settings(e))
    }
}

/// A group of related requests.
pub trait Handler: Send + Sync {
    /// Returns true if this handler serves `request`.
    fn accepts(&self, request: &Request) -> bool;

    /// Serves an accepted request.
    fn handle(&self, request: Request) -> BoxFuture<'_, Result<Value, RouterError>>;
}

/// Tab, window, idle and connectivity signals plus the tracking switch.
pub struct TrackingHandler {
    controller: Arc<TrackingController>,
}

impl TrackingHandler {
    #[must_use]
    pub fn new(controller: Arc<TrackingController>) -> Self {
        Self { controller }
    }

    async fn serve(&self, request: Request) -> Result<Value, RouterError> {
        let c = &self.controller;
        let queued = match request {
            Request::TabActivated {
                tab_id,
                window_id,
                url,
            } => c.handle_tab_activated(tab_id, window_id, url.as_deref()),
            Request::TabUpdated { tab_id, url } => c.handle_tab_updated(tab_id, &url),
            Request::TabRemoved { tab_id } => c.handle_tab_removed(tab_id),
            Request::WindowFocusChanged { window_id } => c.handle_window_focus_changed(window_id),
            Request::IdleStateChanged { state } => c.handle_idle_state_changed(state),
            Request::OnlineStatusChanged { online } => {
                let flushing = c.handle_online_status(online);
                return Ok(json!({ "online": online, "flushTriggered": flushing }));
            }
            Request::SetTrackingEnabled { enabled } => {
                let changed = if enabled {
                    c.enable_tracking().await?
                } else {
                    c.disable_tracking()?
                };
                return Ok(json!({ "trackingEnabled": enabled, "changed": changed }));
            }
            other => return Err(RouterError::Unhandled(other.kind())),
        };
        Ok(json!({ "queued": queued }))
    }
}

impl Handler for TrackingHandler {
    fn accepts(&self, request: &Request) -> bool {
        matches!(
            request,
            Request::TabActivated { .. }
                | Request::TabUpdated { .. }
                | Request::TabRemoved { .. }
                | Request::WindowFocusChanged { .. }
                | Request::IdleStateChanged { .. }
                | Request::OnlineStatusChanged { .. }
                | Request::SetTrackingEnabled { .. }
        )
    }

    fn handle(&self, request: Request) -> BoxFuture<'_, Result<Value, RouterError>> {
        Box::pin(self.serve(request))
    }
}

/// Settings and exclusion list.
pub struct SettingsHandler {
    controller: Arc<TrackingController>,
}

impl SettingsHandler {
    #[must_use]
    pub fn new(controller: Arc<TrackingController>) -> Self {
        Self { controller }
    }

    fn serve(&self, request: Request) -> Result<Value, RouterError> {
        let c = &self.controller;
        match request {
            Request::GetSettings => Ok(json!(c.settings().snapshot())),
            Request::AddExcludedDomain { domain } => Ok(json!(c.exclude_domain(&domain)?)),
            Request::RemoveExcludedDomain { domain } => {
                let removed = c.include_domain(&domain)?;
                Ok(json!({ "removed": removed }))
            }
            Request::SetExcludedDomains { domains } => {
                let list = c.set_excluded_domains(&domains)?;
                Ok(json!({ "excludedDomains": list.to_vec() }))
            }
            other => Err(RouterError::Unhandled(other.kind())),
        }
    }
}

impl Handler for SettingsHandler {
    fn accepts(&self, request: &Request) -> bool {
        matches!(
            request,
            Request::GetSettings
                | Request::AddExcludedDomain { .. }
                | Request::RemoveExcludedDomain { .. }
                | Request::SetExcludedDomains { .. }
        )
    }

    fn handle(&self, request: Request) -> BoxFuture<'_, Result<Value, RouterError>> {
        Box::pin(async move { self.serve(request) })
    }
}

/// Login and logout.
pub struct AuthHandler {
    controller: Arc<TrackingController>,
}

impl AuthHandler {
    #[must_use]
    pub fn new(controller: Arc<TrackingController>) -> Self {
        Self { controller }
    }

    async fn serve(&self, request: Request) -> Result<Value, RouterError> {
        match request {
            Request::Login { email, password } => {
                let email = self.controller.login(&email, password.expose()).await?;
                Ok(json!({ "email": email }))
            }
            Request::Logout => {
                let was_logged_in = self.controller.logout().await?;
                Ok(json!({ "loggedOut": was_logged_in }))
            }
            other => Err(RouterError::Unhandled(other.kind())),
        }
    }
}

impl Handler for AuthHandler {
    fn accepts(&self, request: &Request) -> bool {
        matches!(request, Request::Login { .. } | Request::Logout)
    }

    fn handle(&self, request: Request) -> BoxFuture<'_, Result<Value, RouterError>> {
        Box::pin(self.serve(request))
    }
}

/// Status, manual flush, backend activity and the log buffer.
pub struct DiagnosticsHandler {
    controller: Arc<TrackingController>,
    logs: LogBuffer,
}

impl DiagnosticsHandler {
    #[must_use]
    pub fn new(controller: Arc<TrackingController>, logs: LogBuffer) -> Self {
        Self { controller, logs }
    }

    async fn serve(&self, request: Request) -> Result<Value, RouterError> {
        match request {
            Request::GetStatus => Ok(json!(self.controller.status().await)),
            Request::FlushNow => Ok(flush_json(self.controller.queue().flush().await)),
            Request::GetActivity => Ok(json!(self.controller.auth().activity().await?)),
            Request::GetLogs { limit } => Ok(json!({ "logs": self.logs.recent(limit) })),
            Request::ClearLogs => Ok(json!({ "cleared": self.logs.clear() })),
            other => Err(RouterError::Unhandled(other.kind())),
        }
    }
}

impl Handler for DiagnosticsHandler {
    fn accepts(&self, request: &Request) -> bool {
        matches!(
            request,
            Request::GetStatus
                | Request::FlushNow
                | Request::GetActivity
                | Request::GetLogs { .. }
                | Request::ClearLogs
        )
    }

    fn handle(&self, request: Request) -> BoxFuture<'_, Result<Value, RouterError>> {
        Box::pin(self.serve(request))
    }
}

fn flush_json(outcome: FlushOutcome) -> Value {
    match outcome {
        FlushOutcome::Empty => json!({ "result": "empty" }),
        FlushOutcome::InProgress => json!({ "result": "inProgress" }),
        FlushOutcome::Delivered { count } => json!({ "result": "delivered", "count": count }),
        FlushOutcome::AwaitingLogin { queued } => json!({ "result": "awaitingLogin", "queued": queued }),
        FlushOutcome::Failed {
            reason,
            consecutive_failures,
            retry_in,
        } => json!({
            "result": "failed",
            "reason": reason,
            "consecutiveFailures": consecutive_failures,
            "retryInSecs": retry_in.map(|d| d.as_secs()),
        }),
    }
}

/// Dispatches requests to handlers.
#[derive(Default)]
pub struct Router {
    handlers: Vec<Box<dyn Handler>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the standard handler set.
    #[must_use]
    pub fn standard(controller: Arc<TrackingController>, logs: LogBuffer) -> Self {
        Self::new()
            .with_handler(TrackingHandler::new(controller.clone()))
            .with_handler(SettingsHandler::new(controller.clone()))
            .with_handler(AuthHandler::new(controller.clone()))
            .with_handler(DiagnosticsHandler::new(controller, logs))
    }

    #[must_use]
    pub fn with_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Decodes and serves a raw message payload.
    pub async fn handle_bytes(&self, payload: &[u8]) -> Response {
        match serde_json::from_slice::<Value>(payload) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                warn!(error = %e, "Message is not valid JSON");
                Response::failure(Value::Null, &RouterError::InvalidRequest(e.to_string()))
            }
        }
    }

    /// Serves one decoded message.
    pub async fn dispatch(&self, mut message: Value) -> Response {
        let id = message
            .as_object_mut()
            .and_then(|obj| obj.remove("id"))
            .unwrap_or(Value::Null);

        let request = match serde_json::from_value::<Request>(message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejected malformed request");
                return Response::failure(id, &RouterError::InvalidRequest(e.to_string()));
            }
        };

        let kind = request.kind();
        debug!(request = kind, "Handling request");

        let Some(handler) = self.handlers.iter().find(|h| h.accepts(&request)) else {
            return Response::failure(id, &RouterError::Unhandled(kind));
        };

        match handler.handle(request).await {
            Ok(data) => Response::success(id, data),
            Err(e) => {
                warn!(request = kind, error = %e, "Request failed");
                Response::failure(id, &e)
            }
        }
    }
}
