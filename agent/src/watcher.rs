//! Settings file watcher.
//!
//! The CLI (`tabpulse-agent exclude add …`) edits `settings.json` while the
//! browser-launched agent is running. [`SettingsWatcher`] watches the data
//! directory with [`notify`] and signals changes to `settings.json` through a
//! channel; [`apply_settings_changes`] reloads the settings and lets the
//! controller purge newly excluded events.
//!
//! The notify callback only filters and forwards; reloading happens on an
//! async task. Bursts of events (write to the temp file, then rename) are
//! coalesced by waiting [`SETTLE_DELAY`] and draining the channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::controller::TrackingController;
use crate::storage::SETTINGS_KEY;

/// Time to wait for related events before reloading.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Errors that can occur while setting up the watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    /// The data directory does not exist.
    #[error("watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),
}

/// Marker sent when `settings.json` changed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsChanged;

/// Watches the data directory for edits to `settings.json`.
#[derive(Debug)]
pub struct SettingsWatcher {
    /// Dropping the watcher ends the subscription.
    _watcher: RecommendedWatcher,
    settings_path: PathBuf,
}

impl SettingsWatcher {
    /// Starts watching `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing or the platform watcher
    /// cannot be created.
    pub fn new(data_dir: &Path, sender: mpsc::Sender<SettingsChanged>) -> Result<Self, WatcherError> {
        if !data_dir.is_dir() {
            return Err(WatcherError::DirectoryNotFound(data_dir.to_path_buf()));
        }

        let settings_path = data_dir.join(format!("{SETTINGS_KEY}.json"));
        let filter_path = settings_path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) if is_settings_event(&event, &filter_path) => {
                    trace!(kind = ?event.kind, "Settings file changed");
                    // Full channel means a reload is already pending.
                    let _ = sender.try_send(SettingsChanged);
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Settings watcher error"),
            },
            Config::default(),
        )?;
        watcher.watch(data_dir, RecursiveMode::NonRecursive)?;

        info!(path = %settings_path.display(), "Watching settings file");
        Ok(Self {
            _watcher: watcher,
            settings_path,
        })
    }

    /// Path of the watched settings file.
    #[must_use]
    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }
}

/// Returns true for create, modify or rename events touching `settings_path`.
fn is_settings_event(event: &Event, settings_path: &Path) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    );
    relevant_kind
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == settings_path.file_name())
}

/// Reloads settings whenever a change is signalled, until the channel closes.
pub async fn apply_settings_changes(
    mut receiver: mpsc::Receiver<SettingsChanged>,
    controller: Arc<TrackingController>,
) {
    while receiver.recv().await.is_some() {
        tokio::time::sleep(SETTLE_DELAY).await;
        while receiver.try_recv().is_ok() {}

        match controller.settings().reload() {
            Ok(outcome) if outcome.exclusions_changed || outcome.tracking_changed => {
                info!(
                    exclusions_changed = outcome.exclusions_changed,
                    tracking_changed = outcome.tracking_changed,
                    "Settings reloaded from disk"
                );
                controller.settings_reloaded(outcome);
            }
            Ok(_) => debug!("Settings file touched without changes"),
            Err(e) => warn!(error = %e, "Failed to reload settings"),
        }
    }

    debug!("Settings watcher task shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthManager;
    use crate::client::{BackendClient, ClientError};
    use crate::queue::{EventSink, QueueConfig, QueueManager};
    use crate::settings::SharedSettings;
    use crate::storage::Storage;
    use crate::types::Event as TabEvent;
    use futures::future::BoxFuture;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
    use tempfile::TempDir;

    struct NullSink;

    impl EventSink for NullSink {
        fn send_events<'a>(&'a self, _events: &'a [TabEvent]) -> BoxFuture<'a, Result<(), ClientError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn filters_for_settings_file() {
        let settings = Path::new("/data/settings.json");

        assert!(is_settings_event(
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Any)), "/data/settings.json"),
            settings
        ));
        assert!(is_settings_event(
            &event(EventKind::Create(CreateKind::File), "/data/settings.json"),
            settings
        ));
        assert!(!is_settings_event(
            &event(EventKind::Modify(ModifyKind::Any), "/data/event_queue.json"),
            settings
        ));
        assert!(!is_settings_event(
            &event(EventKind::Remove(RemoveKind::File), "/data/settings.json"),
            settings
        ));
    }

    #[test]
    fn missing_directory_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let result = SettingsWatcher::new(Path::new("/definitely/not/here"), tx);
        assert!(matches!(result, Err(WatcherError::DirectoryNotFound(_))));
    }

    #[tokio::test]
    async fn external_edit_purges_queue() {
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
        let auth = AuthManager::new(BackendClient::new("http://127.0.0.1:9").unwrap(), storage.clone()).unwrap();
        let controller = Arc::new(TrackingController::new(settings, queue, Arc::new(auth), "dev"));
        controller.handle_tab_activated(1, 1, Some("https://a.com/"));
        controller.handle_tab_activated(2, 1, Some("https://b.com/"));

        // Another process (the CLI) excludes a.com.
        let cli_settings = SharedSettings::load(storage).unwrap();
        cli_settings.add_excluded_domain("a.com").unwrap();

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(apply_settings_changes(rx, controller.clone()));
        tx.send(SettingsChanged).await.unwrap();
        tx.send(SettingsChanged).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(controller.settings().is_excluded("a.com"));
        let domains: Vec<_> = controller.queue().events().into_iter().map(|e| e.domain).collect();
        assert_eq!(domains, vec!["b.com"]);
    }
}
