//! TabPulse Agent - native messaging host for tab activity tracking.
//!
//! The browser launches this binary and talks to it over stdin/stdout. Run
//! without a subcommand (or with the launcher arguments the browser passes)
//! it serves native messaging requests until the browser disconnects.
//!
//! # Commands
//!
//! - `tabpulse-agent run`: Serve native messaging (the default)
//! - `tabpulse-agent status`: Show local tracking state
//! - `tabpulse-agent exclude add|remove|list`: Edit the exclusion list
//! - `tabpulse-agent manifest --extension-id <id>`: Print the host manifest
//!
//! # Environment Variables
//!
//! See the [`config`](tabpulse_agent::config) module for available options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use tabpulse_agent::auth::{AuthManager, AuthSession, DeliveryClient};
use tabpulse_agent::client::BackendClient;
use tabpulse_agent::config::{data_dir_from_env, Config};
use tabpulse_agent::controller::TrackingController;
use tabpulse_agent::logs::LogBuffer;
use tabpulse_agent::messaging::{read_frame, write_message};
use tabpulse_agent::queue::QueueManager;
use tabpulse_agent::router::Router;
use tabpulse_agent::settings::SharedSettings;
use tabpulse_agent::storage::{Storage, QUEUE_KEY, SESSION_KEY};
use tabpulse_agent::types::Event;
use tabpulse_agent::watcher::{apply_settings_changes, SettingsWatcher};

/// Native messaging host name registered with the browser.
const HOST_NAME: &str = "dev.tabpulse.agent";

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// TabPulse Agent - native messaging host for tab activity tracking.
///
/// Receives tab signals from the TabPulse extension, queues per-domain
/// activity events and delivers them to the TabPulse backend.
#[derive(Parser, Debug)]
#[command(name = "tabpulse-agent")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    TABPULSE_API_URL              Backend URL (required for 'run')
    TABPULSE_DATA_DIR             Storage directory (default: platform data dir)
    TABPULSE_DEVICE_ID            Device label (default: hostname)
    TABPULSE_BATCH_SIZE           Events per delivery (default: 50)
    TABPULSE_FLUSH_INTERVAL_SECS  Periodic flush interval (default: 30)
    TABPULSE_RETRY_DELAY_SECS     Delay before retrying a failed flush (default: 20)
    TABPULSE_MAX_QUEUE_SIZE       Queue bound (default: 1000)
    TABPULSE_MAX_FAILURES         Failures before tracking is disabled (default: 5)

EXAMPLES:
    # Register the host with Chrome
    tabpulse-agent manifest --extension-id abcdefghijklmnopabcdefghijklmnop \\
        > ~/.config/google-chrome/NativeMessagingHosts/dev.tabpulse.agent.json

    # Stop recording a domain
    tabpulse-agent exclude add mail.example.com
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Arguments the browser passes when launching the host (extension origin,
    /// manifest path). They select the default `run` command.
    #[arg(hide = true)]
    launcher_args: Vec<String>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Serve native messaging requests on stdin/stdout.
    ///
    /// Requires TABPULSE_API_URL environment variable.
    Run,

    /// Show tracking state, queued events and session from local storage.
    Status,

    /// Manage excluded domains.
    Exclude {
        #[command(subcommand)]
        action: ExcludeAction,
    },

    /// Print the native messaging host manifest.
    Manifest {
        /// ID of the TabPulse extension allowed to connect.
        #[arg(long)]
        extension_id: String,

        /// Browser family the manifest is for.
        #[arg(long, value_enum, default_value_t = Browser::Chrome)]
        browser: Browser,

        /// Host binary path (default: this executable).
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ExcludeAction {
    /// Stop recording a domain and its subdomains.
    Add { domain: String },
    /// Resume recording a domain.
    Remove { domain: String },
    /// List excluded domains.
    List,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Browser {
    Chrome,
    Firefox,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Status) => run_status(),
        Some(Command::Exclude { action }) => run_exclude(action),
        Some(Command::Manifest {
            extension_id,
            browser,
            path,
        }) => run_manifest(&extension_id, browser, path),
        Some(Command::Run) | None => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_agent(cli.launcher_args))
        }
    }
}

/// Opens local storage without loading the full configuration.
fn open_storage() -> Result<Storage> {
    let data_dir = data_dir_from_env().context("Failed to determine data directory")?;
    Storage::open(&data_dir).with_context(|| format!("Failed to open {}", data_dir.display()))
}

/// Runs the status command.
fn run_status() -> Result<()> {
    let storage = open_storage()?;
    let settings = SharedSettings::load(storage.clone()).context("Failed to load settings")?;
    let snapshot = settings.snapshot();

    let queued = storage
        .get::<Vec<Event>>(QUEUE_KEY)
        .map(|events| events.map_or(0, |e| e.len()))
        .unwrap_or_else(|e| {
            eprintln!("Warning: queue file unreadable: {e}");
            0
        });
    let session = storage.get::<AuthSession>(SESSION_KEY).ok().flatten();

    println!("Data directory:   {}", storage.root().display());
    println!(
        "Tracking:         {}",
        if snapshot.tracking_enabled { "enabled" } else { "disabled" }
    );
    if let (Some(at), Some(reason)) = (&snapshot.auto_disabled_at, &snapshot.auto_disable_reason) {
        println!("Auto-disabled:    {at} ({reason})");
    }
    match &session {
        Some(session) => println!(
            "Signed in as:     {} (token expires {})",
            session.email(),
            session.expires_at()
        ),
        None => println!("Signed in as:     -"),
    }
    println!("Queued events:    {queued}");
    println!("Excluded domains: {}", snapshot.excluded_domains.len());

    Ok(())
}

/// Runs the exclude subcommands.
///
/// A running agent picks the change up through its settings watcher.
fn run_exclude(action: ExcludeAction) -> Result<()> {
    let settings =
        SharedSettings::load(open_storage()?).context("Failed to load settings")?;

    match action {
        ExcludeAction::Add { domain } => {
            let normalized = settings
                .add_excluded_domain(&domain)
                .with_context(|| format!("Failed to exclude '{domain}'"))?;
            println!("Excluded {normalized}");
        }
        ExcludeAction::Remove { domain } => {
            let removed = settings
                .remove_excluded_domain(&domain)
                .with_context(|| format!("Failed to remove '{domain}'"))?;
            if removed {
                println!("Removed {domain} from exclusions");
            } else {
                println!("{domain} was not excluded");
            }
        }
        ExcludeAction::List => {
            let exclusions = settings.exclusions();
            if exclusions.is_empty() {
                println!("No excluded domains");
            }
            for domain in exclusions.iter() {
                println!("{domain}");
            }
        }
    }

    Ok(())
}

/// Runs the manifest command.
fn run_manifest(extension_id: &str, browser: Browser, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(p) => p,
        None => std::env::current_exe().context("Failed to locate the agent executable")?,
    };

    let mut manifest = json!({
        "name": HOST_NAME,
        "description": "TabPulse native messaging host",
        "path": path.display().to_string(),
        "type": "stdio",
    });
    match browser {
        Browser::Chrome => {
            manifest["allowed_origins"] = json!([format!("chrome-extension://{extension_id}/")]);
        }
        Browser::Firefox => {
            manifest["allowed_extensions"] = json!([extension_id]);
        }
    }

    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

/// Serves native messaging until the browser disconnects.
async fn run_agent(launcher_args: Vec<String>) -> Result<()> {
    let logs = LogBuffer::default();
    init_logging(&logs);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        origin = launcher_args.first().map(String::as_str),
        "Starting TabPulse agent"
    );

    let config = Config::from_env().context("Failed to load configuration")?;

    info!(
        api_url = %config.api_url,
        data_dir = %config.data_dir.display(),
        device_id = %config.device_id,
        "Configuration loaded"
    );

    let storage = Storage::open(&config.data_dir).context(format!(
        "Failed to open data directory {}",
        config.data_dir.display()
    ))?;
    let settings = SharedSettings::load(storage.clone()).context("Failed to load settings")?;

    let client = BackendClient::new(config.api_url.clone()).context("Failed to create HTTP client")?;
    let auth = Arc::new(
        AuthManager::new(client.clone(), storage.clone()).context("Failed to load session")?,
    );
    let delivery = Arc::new(DeliveryClient::new(client, auth.clone()));

    let queue = QueueManager::new(
        config.queue.clone(),
        delivery,
        storage,
        settings.clone(),
        Arc::new(settings.clone()),
    );
    let restored = queue.restore().context("Failed to restore event queue")?;

    // Without a session, events still queue but delivery waits for login.
    if auth.is_authenticated().await {
        queue.start();
    } else {
        info!(restored, "No session, delivery starts after login");
    }

    let controller = Arc::new(TrackingController::new(
        settings,
        queue.clone(),
        auth,
        config.device_id.clone(),
    ));
    let router = Router::standard(controller.clone(), logs);

    let (changes_tx, changes_rx) = mpsc::channel(8);
    let watcher = match SettingsWatcher::new(&config.data_dir, changes_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Settings watcher unavailable, external edits need a restart");
            None
        }
    };
    let reload_task = tokio::spawn(apply_settings_changes(changes_rx, controller));

    info!("Agent running");

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }

            frame = read_frame(&mut stdin) => match frame {
                Ok(Some(payload)) => {
                    let response = router.handle_bytes(&payload).await;
                    debug!(ok = response.ok, "Request served");
                    if let Err(e) = write_message(&mut stdout, &response).await {
                        error!(error = %e, "Failed to write response");
                        break;
                    }
                }
                Ok(None) => {
                    info!("Browser closed the connection");
                    break;
                }
                Err(e) => {
                    // The stream position is unknown after a bad frame.
                    error!(error = %e, "Failed to read message");
                    break;
                }
            }
        }
    }

    info!("Shutting down...");

    drop(watcher);
    reload_task.abort();

    let unflushed = queue
        .shutdown(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
        .await;

    if unflushed > 0 {
        warn!(
            unflushed_events = unflushed,
            "Undelivered events kept for the next run"
        );
    }

    info!("Agent stopped");
    Ok(())
}

/// Initializes logging.
///
/// stdout carries native messaging frames, so the formatter writes to stderr.
/// The log buffer keeps this crate's debug output for the `getLogs` request.
fn init_logging(logs: &LogBuffer) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let buffer_filter = Targets::new()
        .with_target("tabpulse_agent", Level::DEBUG)
        .with_default(Level::INFO);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .with_filter(filter),
        )
        .with(logs.layer().with_filter(buffer_filter))
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
