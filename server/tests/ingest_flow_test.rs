//! Integration tests for the ingest flow over a real socket.
//!
//! A server is bound to an ephemeral port and driven with `reqwest` the way
//! a deployed agent would: login, deliver batches, refresh, read activity,
//! log out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use tabpulse_server::config::Config;
use tabpulse_server::routes::{create_router, AppState};

// ============================================================================
// Test Helpers
// ============================================================================

fn config_with_user() -> Config {
    let mut users = HashMap::new();
    users.insert("ada@example.com".to_string(), "hunter2".to_string());
    Config {
        users,
        port: 0,
        ..Config::default()
    }
}

async fn spawn_server(config: Config) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = create_router(AppState::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    (addr, handle)
}

async fn login(client: &reqwest::Client, addr: SocketAddr) -> Value {
    let response = client
        .post(format!("http://{addr}/auth/login"))
        .json(&json!({ "email": "ada@example.com", "password": "hunter2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.json().await.unwrap()
}

fn tab_events() -> Value {
    json!({ "events": [
        { "eventType": "active", "domain": "docs.rs", "timestamp": "2026-10-18T09:00:00Z" },
        { "eventType": "inactive", "domain": "docs.rs", "timestamp": "2026-10-18T09:10:00Z" },
        { "eventType": "active", "domain": "github.com", "timestamp": "2026-10-18T09:10:00Z" }
    ]})
}

// ============================================================================
// Flow Tests
// ============================================================================

#[tokio::test]
async fn test_full_session_lifecycle() {
    let (addr, handle) = spawn_server(config_with_user()).await;
    let client = reqwest::Client::new();

    let tokens = login(&client, addr).await;
    let access = tokens["accessToken"].as_str().unwrap().to_string();
    assert_eq!(tokens["expiresIn"], 900);

    let ingest = client
        .post(format!("http://{addr}/events"))
        .bearer_auth(&access)
        .json(&tab_events())
        .send()
        .await
        .unwrap();
    assert_eq!(ingest.status(), StatusCode::ACCEPTED);

    let refreshed: Value = client
        .post(format!("http://{addr}/auth/refresh"))
        .json(&json!({ "refreshToken": tokens["refreshToken"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let access = refreshed["accessToken"].as_str().unwrap().to_string();

    let activity: Value = client
        .get(format!("http://{addr}/activity"))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(activity["totalEvents"], 3);
    assert_eq!(activity["domains"][0]["domain"], "docs.rs");
    assert_eq!(activity["domains"][0]["activeCount"], 1);
    assert_eq!(activity["domains"][0]["inactiveCount"], 1);
    assert_eq!(activity["domains"][0]["lastSeen"], "2026-10-18T09:10:00Z");

    let logout = client
        .post(format!("http://{addr}/auth/logout"))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    assert_eq!(logout.status(), StatusCode::NO_CONTENT);

    let after = client
        .get(format!("http://{addr}/activity"))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    assert_eq!(after.status(), StatusCode::UNAUTHORIZED);

    handle.abort();
}

#[tokio::test]
async fn test_health_counts_stored_events() {
    let (addr, handle) = spawn_server(config_with_user()).await;
    let client = reqwest::Client::new();
    let tokens = login(&client, addr).await;

    client
        .post(format!("http://{addr}/events"))
        .bearer_auth(tokens["accessToken"].as_str().unwrap())
        .json(&tab_events())
        .send()
        .await
        .unwrap();

    let health: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health["status"], "ok");
    assert_eq!(health["storedEvents"], 3);
    assert_eq!(health["activeSessions"], 1);

    handle.abort();
}

#[tokio::test]
async fn test_users_only_see_their_own_activity() {
    let mut config = config_with_user();
    config
        .users
        .insert("bob@example.com".to_string(), "swordfish".to_string());
    let (addr, handle) = spawn_server(config).await;
    let client = reqwest::Client::new();

    let ada = login(&client, addr).await;
    client
        .post(format!("http://{addr}/events"))
        .bearer_auth(ada["accessToken"].as_str().unwrap())
        .json(&tab_events())
        .send()
        .await
        .unwrap();

    let bob: Value = client
        .post(format!("http://{addr}/auth/login"))
        .json(&json!({ "email": "bob@example.com", "password": "swordfish" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let activity: Value = client
        .get(format!("http://{addr}/activity"))
        .bearer_auth(bob["accessToken"].as_str().unwrap())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(activity["email"], "bob@example.com");
    assert_eq!(activity["totalEvents"], 0);

    handle.abort();
}

#[tokio::test]
async fn test_unsafe_mode_accepts_any_login() {
    let config = Config {
        unsafe_no_auth: true,
        port: 0,
        ..Config::default()
    };
    let (addr, handle) = spawn_server(config).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/auth/login"))
        .json(&json!({ "email": "dev@localhost", "password": "anything" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let anonymous = client
        .post(format!("http://{addr}/events"))
        .json(&tab_events())
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::ACCEPTED);

    handle.abort();
}

#[tokio::test]
async fn test_cors_preflight_is_answered() {
    let (addr, handle) = spawn_server(config_with_user()).await;
    let client = reqwest::Client::new();

    let response = client
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/events"))
        .header("Origin", "chrome-extension://abcdefghijklmnop")
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "authorization,content-type")
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    handle.abort();
}
