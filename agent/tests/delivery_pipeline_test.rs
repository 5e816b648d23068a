//! Integration tests for the delivery pipeline.
//!
//! These tests drive tab signals through the controller and deliver the
//! resulting events through the authenticated client to a mock backend.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tabpulse_agent::auth::{AuthManager, DeliveryClient};
use tabpulse_agent::client::BackendClient;
use tabpulse_agent::controller::TrackingController;
use tabpulse_agent::queue::{FlushOutcome, QueueConfig, QueueManager};
use tabpulse_agent::settings::SharedSettings;
use tabpulse_agent::storage::{Storage, QUEUE_KEY};
use tabpulse_agent::types::Event;

// =============================================================================
// Test Helpers
// =============================================================================

fn tokens(access: &str, refresh: &str) -> Value {
    json!({
        "accessToken": access,
        "refreshToken": refresh,
        "expiresIn": 900,
        "email": "ada@example.com"
    })
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tokens("access-1", "refresh-1")))
        .mount(server)
        .await;
}

struct Pipeline {
    _dir: TempDir,
    storage: Storage,
    controller: Arc<TrackingController>,
}

impl Pipeline {
    fn queue(&self) -> &QueueManager {
        self.controller.queue()
    }
}

/// Wires the same components the binary does, against `server`.
fn pipeline(server: &MockServer, config: QueueConfig) -> Pipeline {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let settings = SharedSettings::load(storage.clone()).unwrap();
    let client = BackendClient::new(server.uri()).unwrap();
    let auth = Arc::new(AuthManager::new(client.clone(), storage.clone()).unwrap());
    let delivery = Arc::new(DeliveryClient::new(client, auth.clone()));
    let queue = QueueManager::new(
        config,
        delivery,
        storage.clone(),
        settings.clone(),
        Arc::new(settings.clone()),
    );
    let controller = Arc::new(TrackingController::new(settings, queue, auth, "test-device"));

    Pipeline {
        _dir: dir,
        storage,
        controller,
    }
}

async fn delivered_batches(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == "/events")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

// =============================================================================
// Delivery Tests
// =============================================================================

/// Tab switches become active/inactive events delivered with the access token.
#[tokio::test]
async fn test_tab_switches_are_delivered_in_one_batch() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let p = pipeline(&server, QueueConfig::default());
    p.controller.login("ada@example.com", "hunter2").await.unwrap();

    p.controller.handle_tab_activated(1, 1, Some("https://docs.rs/tokio"));
    p.controller.handle_tab_activated(2, 1, Some("https://github.com/rust-lang"));

    let outcome = p.queue().flush().await;

    assert_eq!(outcome, FlushOutcome::Delivered { count: 3 });
    assert!(p.queue().is_empty());

    let batches = delivered_batches(&server).await;
    let events = batches[0]["events"].as_array().unwrap();
    let summary: Vec<(&str, &str)> = events
        .iter()
        .map(|e| (e["eventType"].as_str().unwrap(), e["domain"].as_str().unwrap()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("active", "docs.rs"),
            ("inactive", "docs.rs"),
            ("active", "github.com"),
        ]
    );

    let persisted: Vec<Event> = p.storage.get(QUEUE_KEY).unwrap().unwrap_or_default();
    assert!(persisted.is_empty());
}

/// A 401 on delivery refreshes the session and retries the same batch once.
#[tokio::test]
async fn test_expired_token_is_refreshed_and_batch_retried() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tokens("access-2", "refresh-2")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .and(header("authorization", "Bearer access-2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let p = pipeline(&server, QueueConfig::default());
    p.controller.login("ada@example.com", "hunter2").await.unwrap();
    p.controller.handle_tab_activated(1, 1, Some("https://example.com/"));

    let outcome = p.queue().flush().await;

    assert_eq!(outcome, FlushOutcome::Delivered { count: 1 });
    assert_eq!(p.queue().consecutive_failures(), 0);
}

/// Events recorded before login wait in the queue and go out after login.
#[tokio::test]
async fn test_events_wait_for_login() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let p = pipeline(&server, QueueConfig::default());
    p.controller.handle_tab_activated(1, 1, Some("https://example.com/"));

    let outcome = p.queue().flush().await;
    assert_eq!(outcome, FlushOutcome::AwaitingLogin { queued: 1 });
    assert_eq!(p.queue().len(), 1);
    assert_eq!(p.queue().consecutive_failures(), 0);

    p.controller.login("ada@example.com", "hunter2").await.unwrap();
    let outcome = p.queue().flush().await;

    assert_eq!(outcome, FlushOutcome::Delivered { count: 1 });
}

/// Without a session, filling batches never counts as a delivery failure,
/// so tracking stays on however many batches pile up.
#[tokio::test]
async fn test_missing_session_does_not_disable_tracking() {
    let server = MockServer::start().await;

    let config = QueueConfig {
        batch_size: 2,
        retry_delay: Duration::from_millis(10),
        ..QueueConfig::default()
    };
    let p = pipeline(&server, config);
    assert!(p.controller.settings().is_tracking_enabled());

    for tab in 1..=6 {
        let url = format!("https://site{tab}.example.com/");
        p.controller.handle_tab_activated(tab, 1, Some(url.as_str()));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = p.queue().stats();
    assert!(p.controller.settings().is_tracking_enabled());
    assert!(p.controller.settings().snapshot().auto_disable_reason.is_none());
    assert_eq!(stats.consecutive_failures, 0);
    assert!(!stats.disabled_by_failures);
    assert!(!stats.retry_pending);
    assert!(stats.awaiting_login);
    assert_eq!(stats.queued, 11);
    assert!(delivered_batches(&server).await.is_empty());
}

// =============================================================================
// Failure Handling Tests
// =============================================================================

/// Repeated server errors keep events queued and eventually disable tracking.
#[tokio::test]
async fn test_repeated_failures_disable_tracking() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let config = QueueConfig {
        max_failures_before_disable: 2,
        ..QueueConfig::default()
    };
    let p = pipeline(&server, config);
    p.controller.login("ada@example.com", "hunter2").await.unwrap();
    p.controller.handle_tab_activated(1, 1, Some("https://example.com/"));

    let first = p.queue().flush().await;
    assert!(matches!(
        first,
        FlushOutcome::Failed { consecutive_failures: 1, retry_in: Some(_), .. }
    ));
    assert!(p.controller.settings().is_tracking_enabled());

    let second = p.queue().flush().await;
    assert!(matches!(
        second,
        FlushOutcome::Failed { consecutive_failures: 2, retry_in: None, .. }
    ));

    let settings = p.controller.settings().snapshot();
    assert!(!settings.tracking_enabled);
    assert!(settings.auto_disabled_at.is_some());
    assert!(settings.auto_disable_reason.is_some());

    // Nothing is lost: the batch stays queued for a later run.
    assert_eq!(p.queue().len(), 1);
    assert!(p.queue().stats().disabled_by_failures);

    // No further events are recorded while disabled.
    assert_eq!(p.controller.handle_tab_activated(2, 1, Some("https://other.com/")), 0);
}

/// Re-enabling after an auto-disable resets the failure count and delivers.
#[tokio::test]
async fn test_reenabling_recovers_from_auto_disable() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = QueueConfig {
        max_failures_before_disable: 1,
        ..QueueConfig::default()
    };
    let p = pipeline(&server, config);
    p.controller.login("ada@example.com", "hunter2").await.unwrap();
    p.controller.handle_tab_activated(1, 1, Some("https://example.com/"));

    assert!(matches!(p.queue().flush().await, FlushOutcome::Failed { .. }));
    assert!(!p.controller.settings().is_tracking_enabled());

    assert!(p.controller.enable_tracking().await.unwrap());
    assert_eq!(p.queue().consecutive_failures(), 0);

    let outcome = p.queue().flush().await;
    assert!(matches!(outcome, FlushOutcome::Delivered { .. }));
    assert!(p.queue().is_empty());
    p.queue().stop();
}

/// Queued events survive a restart through the queue document.
#[tokio::test]
async fn test_queue_survives_restart() {
    let server = MockServer::start().await;

    let p = pipeline(&server, QueueConfig::default());
    p.controller.handle_tab_activated(1, 1, Some("https://example.com/"));
    p.controller.handle_tab_updated(1, "https://rust-lang.org/");
    assert_eq!(p.queue().len(), 3);

    let settings = SharedSettings::load(p.storage.clone()).unwrap();
    let client = BackendClient::new(server.uri()).unwrap();
    let auth = Arc::new(AuthManager::new(client.clone(), p.storage.clone()).unwrap());
    let restarted = QueueManager::new(
        QueueConfig::default(),
        Arc::new(DeliveryClient::new(client, auth)),
        p.storage.clone(),
        settings.clone(),
        Arc::new(settings),
    );

    assert_eq!(restarted.restore().unwrap(), 3);
    let domains: Vec<String> = restarted.events().into_iter().map(|e| e.domain).collect();
    assert_eq!(domains, vec!["example.com", "example.com", "rust-lang.org"]);
}
