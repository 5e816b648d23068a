//! Tracking controller.
//!
//! Connects the [`TabTracker`] to the [`QueueManager`] and keeps both in step
//! with the persisted [`SharedSettings`]. Browser signals arrive here from the
//! message router; attention changes come out as queued events.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::{AuthError, AuthManager, AuthStatus};
use crate::domain::ExclusionList;
use crate::queue::{AddOutcome, QueueManager, QueueStats};
use crate::settings::{ReloadOutcome, SettingsError, SharedSettings};
use crate::storage::StorageError;
use crate::tracker::{DomainTransition, IdleState, TabId, TabTracker, WindowId};

/// Errors from controller operations.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Tracking can only be enabled with a session.
    #[error("login required before tracking can be enabled")]
    NotAuthenticated,

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Combined agent status for the extension UI and the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub device_id: String,
    pub version: &'static str,
    pub tracking_enabled: bool,
    pub current_domain: Option<String>,
    pub auto_disabled_at: Option<DateTime<Utc>>,
    pub auto_disable_reason: Option<String>,
    pub excluded_domains: Vec<String>,
    pub auth: AuthStatus,
    pub queue: QueueStats,
}

/// A newly excluded domain and the queued events removed for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub domain: String,
    pub purged: usize,
}

/// Routes tracker output into the queue according to the settings.
#[derive(Debug)]
pub struct TrackingController {
    tracker: Mutex<TabTracker>,
    settings: SharedSettings,
    queue: QueueManager,
    auth: Arc<AuthManager>,
    device_id: String,
}

impl TrackingController {
    #[must_use]
    pub fn new(
        settings: SharedSettings,
        queue: QueueManager,
        auth: Arc<AuthManager>,
        device_id: impl Into<String>,
    ) -> Self {
        let tracker = TabTracker::new(settings.is_tracking_enabled());
        Self {
            tracker: Mutex::new(tracker),
            settings,
            queue,
            auth,
            device_id: device_id.into(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    #[must_use]
    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    fn tracker(&self) -> MutexGuard<'_, TabTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a tracker signal and queues the resulting events.
    ///
    /// Returns how many events were queued.
    fn apply<F>(&self, signal: F) -> usize
    where
        F: FnOnce(&mut TabTracker) -> Vec<DomainTransition>,
    {
        let transitions = {
            let mut tracker = self.tracker();
            let mut transitions = self.sync_tracker(&mut tracker);
            transitions.extend(signal(&mut tracker));
            transitions
        };
        self.enqueue(transitions)
    }

    /// Follows a tracking switch flipped elsewhere (auto-disable, CLI edit).
    ///
    /// Ending the current domain because of such a switch is not recorded.
    fn sync_tracker(&self, tracker: &mut TabTracker) -> Vec<DomainTransition> {
        let enabled = self.settings.is_tracking_enabled();
        if tracker.is_enabled() == enabled {
            return Vec::new();
        }
        debug!(enabled, "Tracker following settings");
        let transitions = tracker.set_enabled(enabled);
        if enabled {
            transitions
        } else {
            Vec::new()
        }
    }

    fn enqueue(&self, transitions: Vec<DomainTransition>) -> usize {
        transitions
            .into_iter()
            .filter(|t| {
                !matches!(
                    self.queue.add_event(t.event_type, t.domain.clone()),
                    AddOutcome::Excluded
                )
            })
            .count()
    }

    pub fn handle_tab_activated(&self, tab_id: TabId, window_id: WindowId, url: Option<&str>) -> usize {
        self.apply(|t| t.tab_activated(tab_id, window_id, url))
    }

    pub fn handle_tab_updated(&self, tab_id: TabId, url: &str) -> usize {
        self.apply(|t| t.tab_updated(tab_id, url))
    }

    pub fn handle_tab_removed(&self, tab_id: TabId) -> usize {
        self.apply(|t| t.tab_removed(tab_id))
    }

    pub fn handle_window_focus_changed(&self, window_id: Option<WindowId>) -> usize {
        self.apply(|t| t.window_focus_changed(window_id))
    }

    pub fn handle_idle_state_changed(&self, state: IdleState) -> usize {
        self.apply(|t| t.idle_state_changed(state))
    }

    /// Forwards connectivity to the queue. Returns `true` if a flush started.
    pub fn handle_online_status(&self, online: bool) -> bool {
        self.queue.set_online_status(online)
    }

    /// Turns tracking on. Requires a session.
    ///
    /// Clears any automatic disable, resets the queue failure state and
    /// starts recording the attended domain. Returns `false` if tracking was
    /// already on.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::NotAuthenticated`] without a session.
    pub async fn enable_tracking(&self) -> Result<bool, ControllerError> {
        if !self.auth.is_authenticated().await {
            return Err(ControllerError::NotAuthenticated);
        }

        let changed = self.settings.set_tracking_enabled(true)?;
        self.queue.resume();

        let transitions = self.tracker().set_enabled(true);
        self.enqueue(transitions);

        if changed {
            info!("Tracking enabled");
        }
        Ok(changed)
    }

    /// Turns tracking off at the user's request, recording the end of the
    /// current domain first. Returns `false` if tracking was already off.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be saved.
    pub fn disable_tracking(&self) -> Result<bool, ControllerError> {
        let transitions = self.tracker().set_enabled(false);
        self.enqueue(transitions);

        let changed = self.settings.set_tracking_enabled(false)?;
        if changed {
            info!("Tracking disabled");
        }
        Ok(changed)
    }

    /// Adds an exclusion and purges queued events for the domain and its
    /// subdomains.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid domains or storage failures.
    pub fn exclude_domain(&self, raw: &str) -> Result<Exclusion, ControllerError> {
        let domain = self.settings.add_excluded_domain(raw)?;
        let purged = self.queue.purge_domain(&domain);
        info!(domain = %domain, purged, "Domain excluded");
        Ok(Exclusion { domain, purged })
    }

    /// Removes an exclusion. Returns `false` if it was not present.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid domains or storage failures.
    pub fn include_domain(&self, raw: &str) -> Result<bool, ControllerError> {
        let removed = self.settings.remove_excluded_domain(raw)?;
        if removed {
            info!(domain = %raw, "Domain no longer excluded");
        }
        Ok(removed)
    }

    /// Replaces the exclusion list and purges matching queued events.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be saved.
    pub fn set_excluded_domains(&self, domains: &[String]) -> Result<ExclusionList, ControllerError> {
        let list = self.settings.set_excluded_domains(domains)?;
        let purged = self.queue.apply_exclusions();
        info!(excluded = list.len(), purged, "Exclusion list replaced");
        Ok(list)
    }

    /// Reacts to settings edited outside the agent.
    pub fn settings_reloaded(&self, outcome: ReloadOutcome) {
        if outcome.exclusions_changed {
            self.queue.apply_exclusions();
        }
        if outcome.tracking_changed {
            let enabled = self.settings.is_tracking_enabled();
            let transitions = self.tracker().set_enabled(enabled);
            self.enqueue(transitions);
            if enabled {
                self.queue.resume();
            }
            info!(enabled, "Tracking switch changed externally");
        }
    }

    /// Logs in and starts delivery. Returns the account email.
    ///
    /// # Errors
    ///
    /// See [`AuthManager::login`].
    pub async fn login(&self, email: &str, password: &str) -> Result<String, ControllerError> {
        let account = self.auth.login(email, password).await?;
        self.queue.resume();
        Ok(account)
    }

    /// Stops tracking and ends the session.
    ///
    /// # Errors
    ///
    /// Returns an error if settings or the session cannot be updated.
    pub async fn logout(&self) -> Result<bool, ControllerError> {
        self.disable_tracking()?;
        Ok(self.auth.logout().await?)
    }

    /// Snapshot of everything the UI shows.
    pub async fn status(&self) -> AgentStatus {
        let settings = self.settings.snapshot();
        let current_domain = self.tracker().current_domain().map(str::to_string);
        AgentStatus {
            device_id: self.device_id.clone(),
            version: env!("CARGO_PKG_VERSION"),
            tracking_enabled: settings.tracking_enabled,
            current_domain,
            auto_disabled_at: settings.auto_disabled_at,
            auto_disable_reason: settings.auto_disable_reason,
            excluded_domains: settings.excluded_domains,
            auth: self.auth.status().await,
            queue: self.queue.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BackendClient, ClientError};
    use crate::queue::{EventSink, QueueConfig};
    use crate::storage::Storage;
    use crate::types::{Event, EventType};
    use futures::future::BoxFuture;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct NullSink;

    impl EventSink for NullSink {
        fn send_events<'a>(&'a self, _events: &'a [Event]) -> BoxFuture<'a, Result<(), ClientError>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct Fixture {
        dir: TempDir,
        controller: TrackingController,
    }

    fn fixture(api_url: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let settings = SharedSettings::load(storage.clone()).unwrap();
        let queue = QueueManager::new(
            QueueConfig::default(),
            Arc::new(NullSink),
            storage.clone(),
            settings.clone(),
            Arc::new(settings.clone()),
        );
        let auth = AuthManager::new(BackendClient::new(api_url).unwrap(), storage).unwrap();
        Fixture {
            dir,
            controller: TrackingController::new(settings, queue, Arc::new(auth), "test-device"),
        }
    }

    fn queued(controller: &TrackingController) -> Vec<String> {
        controller
            .queue()
            .events()
            .iter()
            .map(|e| format!("{}:{}", e.event_type, e.domain))
            .collect()
    }

    async fn logged_in_fixture() -> (MockServer, Fixture) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "a",
                "refreshToken": "r",
                "expiresIn": 900,
                "email": "ada@example.com"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/logout"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        let f = fixture(&server.uri());
        f.controller.login("ada@example.com", "pw").await.unwrap();
        (server, f)
    }

    #[test]
    fn tab_signals_become_queued_events() {
        let f = fixture("http://127.0.0.1:9");
        let c = &f.controller;

        assert_eq!(c.handle_tab_activated(1, 1, Some("https://a.com/")), 1);
        assert_eq!(c.handle_tab_activated(2, 1, Some("https://b.com/")), 2);
        assert_eq!(c.handle_window_focus_changed(None), 1);

        assert_eq!(
            queued(c),
            vec!["active:a.com", "inactive:a.com", "active:b.com", "inactive:b.com"]
        );
    }

    #[test]
    fn excluded_domains_are_not_queued() {
        let f = fixture("http://127.0.0.1:9");
        let c = &f.controller;
        c.exclude_domain("secret.org").unwrap();

        assert_eq!(c.handle_tab_activated(1, 1, Some("https://mail.secret.org/")), 0);
        assert!(c.queue().is_empty());
    }

    #[test]
    fn excluding_purges_queued_events() {
        let f = fixture("http://127.0.0.1:9");
        let c = &f.controller;
        c.handle_tab_activated(1, 1, Some("https://a.com/"));
        c.handle_tab_activated(2, 1, Some("https://b.com/"));

        let exclusion = c.exclude_domain("A.com").unwrap();

        assert_eq!(exclusion.domain, "a.com");
        assert_eq!(exclusion.purged, 2);
        assert_eq!(queued(c), vec!["active:b.com"]);
    }

    #[test]
    fn exclusion_counts_only_its_own_purge() {
        let f = fixture("http://127.0.0.1:9");
        let c = &f.controller;
        c.handle_tab_activated(1, 1, Some("https://x.com/"));
        c.handle_tab_activated(2, 1, Some("https://a.com/"));
        // Excluded behind the controller's back; purged at the next flush.
        c.settings().add_excluded_domain("x.com").unwrap();

        let exclusion = c.exclude_domain("a.com").unwrap();

        assert_eq!(exclusion.purged, 1);
        assert_eq!(queued(c), vec!["active:x.com", "inactive:x.com"]);
    }

    #[test]
    fn user_disable_closes_current_domain() {
        let f = fixture("http://127.0.0.1:9");
        let c = &f.controller;
        c.handle_tab_activated(1, 1, Some("https://a.com/"));

        assert!(c.disable_tracking().unwrap());
        assert_eq!(queued(c), vec!["active:a.com", "inactive:a.com"]);

        assert_eq!(c.handle_tab_activated(2, 1, Some("https://b.com/")), 0);
        assert!(!c.settings().is_tracking_enabled());
    }

    #[test]
    fn auto_disable_stops_recording_silently() {
        use crate::queue::TrackingSwitch;

        let f = fixture("http://127.0.0.1:9");
        let c = &f.controller;
        c.handle_tab_activated(1, 1, Some("https://a.com/"));

        c.settings().disable_tracking("5 consecutive delivery failures");

        assert_eq!(c.handle_tab_activated(2, 1, Some("https://b.com/")), 0);
        assert_eq!(queued(c), vec!["active:a.com"]);
    }

    #[tokio::test]
    async fn enabling_requires_a_session() {
        let f = fixture("http://127.0.0.1:9");
        f.controller.disable_tracking().unwrap();

        let err = f.controller.enable_tracking().await.unwrap_err();

        assert!(matches!(err, ControllerError::NotAuthenticated));
        assert!(!f.controller.settings().is_tracking_enabled());
    }

    #[tokio::test]
    async fn enabling_resumes_and_records_attended_domain() {
        let (_server, f) = logged_in_fixture().await;
        let c = &f.controller;
        c.disable_tracking().unwrap();
        c.handle_tab_activated(1, 1, Some("https://a.com/"));
        assert!(c.queue().is_empty());

        assert!(c.enable_tracking().await.unwrap());

        assert_eq!(queued(c), vec!["active:a.com"]);
        let settings = c.settings().snapshot();
        assert!(settings.tracking_enabled);
        assert!(settings.auto_disabled_at.is_none());
        c.queue().stop();
    }

    #[tokio::test]
    async fn logout_disables_tracking() {
        let (_server, f) = logged_in_fixture().await;
        let c = &f.controller;
        c.handle_tab_activated(1, 1, Some("https://a.com/"));

        assert!(c.logout().await.unwrap());

        assert!(!c.settings().is_tracking_enabled());
        assert!(!c.auth().is_authenticated().await);
        assert_eq!(queued(c), vec!["active:a.com", "inactive:a.com"]);
        c.queue().stop();
    }

    #[test]
    fn external_reload_purges_and_follows_switch() {
        let f = fixture("http://127.0.0.1:9");
        let c = &f.controller;
        c.handle_tab_activated(1, 1, Some("https://a.com/"));

        let storage = Storage::open(f.dir.path()).unwrap();
        let mut edited = c.settings().snapshot();
        edited.excluded_domains.push("a.com".to_string());
        edited.tracking_enabled = false;
        storage.set(crate::storage::SETTINGS_KEY, &edited).unwrap();

        let outcome = c.settings().reload().unwrap();
        c.settings_reloaded(outcome);

        assert!(c.queue().is_empty());
        assert_eq!(c.handle_tab_activated(2, 1, Some("https://b.com/")), 0);
    }

    #[tokio::test]
    async fn status_reports_current_state() {
        let f = fixture("http://127.0.0.1:9");
        let c = &f.controller;
        c.handle_tab_activated(1, 1, Some("https://a.com/"));
        c.exclude_domain("b.com").unwrap();

        let status = c.status().await;

        assert_eq!(status.device_id, "test-device");
        assert!(status.tracking_enabled);
        assert_eq!(status.current_domain.as_deref(), Some("a.com"));
        assert_eq!(status.excluded_domains, vec!["b.com"]);
        assert!(!status.auth.authenticated);
        assert_eq!(status.queue.queued, 1);
    }

    #[test]
    fn events_use_tracker_types() {
        let f = fixture("http://127.0.0.1:9");
        f.controller.handle_tab_activated(1, 1, Some("https://a.com/"));
        assert_eq!(f.controller.queue().events()[0].event_type, EventType::Active);
    }
}
