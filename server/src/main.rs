//! TabPulse Server - main entry point.
//!
//! Starts the ingest backend with JSON logging, periodic cleanup of expired
//! tokens and idle rate limit state, and graceful shutdown on SIGTERM/SIGINT.
//!
//! ```bash
//! # Development mode (any login accepted, tokens optional)
//! TABPULSE_UNSAFE_NO_AUTH=true cargo run --bin tabpulse-server
//!
//! # Production mode
//! TABPULSE_USERS="ada@example.com:hunter2" PORT=8080 \
//!     cargo run --release --bin tabpulse-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use tabpulse_server::config::Config;
use tabpulse_server::routes::{create_router, AppState};
use tabpulse_server::session::TokenStore;

/// How often idle rate limit state is swept.
const RATE_LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How often expired tokens are swept.
const TOKEN_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (when auth enabled):");
            eprintln!("  TABPULSE_USERS             - Format: email1:password1,email2:password2");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                       - HTTP server port (default: 8080)");
            eprintln!("  TABPULSE_ACCESS_TTL_SECS   - Access token lifetime (default: 900)");
            eprintln!("  TABPULSE_REFRESH_TTL_SECS  - Refresh token lifetime (default: 2592000)");
            eprintln!("  TABPULSE_UNSAFE_NO_AUTH    - Disable auth (dev only, set to 'true')");
            eprintln!("  RUST_LOG                   - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    if config.unsafe_no_auth {
        warn!("Authentication is DISABLED; any login is accepted");
    }
    info!(
        port = config.port,
        user_count = config.users.len(),
        access_ttl_secs = config.access_ttl.as_secs(),
        "TabPulse server starting"
    );

    let port = config.port;
    let state = AppState::new(config);

    let rate_limit_sweeper = state.rate_limiter.spawn_sweeper(RATE_LIMITER_SWEEP_INTERVAL);
    let token_cleanup = spawn_token_cleanup(state.tokens.clone(), TOKEN_CLEANUP_INTERVAL);

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    let result = server.await;

    rate_limit_sweeper.abort();
    token_cleanup.abort();

    if let Err(err) = result {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// JSON logs filtered by `RUST_LOG` (default `info`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

fn spawn_token_cleanup(tokens: Arc<TokenStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = tokens.cleanup_expired();
            if removed > 0 {
                debug!(removed_count = removed, "Swept expired tokens");
            }
        }
    })
}

/// Resolves on SIGINT or SIGTERM.
///
/// In-flight requests are allowed to finish; axum stops accepting new
/// connections once this returns.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        () = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
