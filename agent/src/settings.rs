//! User settings persisted in storage.
//!
//! Settings hold the tracking switch and the domain exclusion list. They are
//! shared between the message router, the tracking controller and the queue
//! through [`SharedSettings`], a cheap-to-clone handle; every mutation is
//! written back to storage immediately.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{normalize_domain, DomainError, ExclusionList};
use crate::queue::TrackingSwitch;
use crate::storage::{Storage, StorageError, SETTINGS_KEY};

/// Errors raised by settings mutations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The supplied domain could not be normalized.
    #[error("invalid domain: {0}")]
    Domain(#[from] DomainError),

    /// Persisting the settings failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Persisted user settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Whether tab activity is currently recorded.
    pub tracking_enabled: bool,

    /// Normalized domains that are never recorded.
    pub excluded_domains: Vec<String>,

    /// When delivery failures last switched tracking off.
    pub auto_disabled_at: Option<DateTime<Utc>>,

    /// Why tracking was switched off automatically.
    pub auto_disable_reason: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tracking_enabled: true,
            excluded_domains: Vec::new(),
            auto_disabled_at: None,
            auto_disable_reason: None,
        }
    }
}

/// What changed after re-reading settings from disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadOutcome {
    /// The exclusion list differs from the previous one.
    pub exclusions_changed: bool,

    /// The tracking switch flipped.
    pub tracking_changed: bool,
}

#[derive(Debug)]
struct SettingsState {
    settings: Settings,
    exclusions: ExclusionList,
}

impl SettingsState {
    fn new(mut settings: Settings) -> Self {
        let exclusions = ExclusionList::from_entries(&settings.excluded_domains);
        settings.excluded_domains = exclusions.to_vec();
        Self {
            settings,
            exclusions,
        }
    }

    fn sync_exclusions(&mut self) {
        self.settings.excluded_domains = self.exclusions.to_vec();
    }
}

/// Shared handle to the persisted settings.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    state: Arc<RwLock<SettingsState>>,
    storage: Storage,
}

impl SharedSettings {
    /// Loads settings from storage, falling back to defaults when the
    /// document is missing or corrupt.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures other than a missing file.
    pub fn load(storage: Storage) -> Result<Self, StorageError> {
        let settings = read_settings(&storage)?;
        Ok(Self {
            state: Arc::new(RwLock::new(SettingsState::new(settings))),
            storage,
        })
    }

    /// Creates a handle around explicit settings and persists them.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be written.
    pub fn create(storage: Storage, settings: Settings) -> Result<Self, StorageError> {
        let state = SettingsState::new(settings);
        storage.set(SETTINGS_KEY, &state.settings)?;
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            storage,
        })
    }

    /// Returns a copy of the current settings.
    #[must_use]
    pub fn snapshot(&self) -> Settings {
        self.read(|state| state.settings.clone())
    }

    /// Returns whether tracking is enabled.
    #[must_use]
    pub fn is_tracking_enabled(&self) -> bool {
        self.read(|state| state.settings.tracking_enabled)
    }

    /// Returns a copy of the exclusion list.
    #[must_use]
    pub fn exclusions(&self) -> ExclusionList {
        self.read(|state| state.exclusions.clone())
    }

    /// Returns whether `domain` is excluded from tracking.
    #[must_use]
    pub fn is_excluded(&self, domain: &str) -> bool {
        self.read(|state| state.exclusions.is_excluded(domain))
    }

    /// Turns tracking on or off. Enabling clears any auto-disable marker.
    ///
    /// Returns `true` if the flag changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be persisted.
    pub fn set_tracking_enabled(&self, enabled: bool) -> Result<bool, StorageError> {
        self.write(|state| {
            let changed = state.settings.tracking_enabled != enabled;
            state.settings.tracking_enabled = enabled;
            if enabled {
                state.settings.auto_disabled_at = None;
                state.settings.auto_disable_reason = None;
            }
            changed
        })
    }

    /// Adds a domain to the exclusion list and returns its normalized form.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Domain`] if the input is not a valid domain.
    pub fn add_excluded_domain(&self, raw: &str) -> Result<String, SettingsError> {
        let domain = normalize_domain(raw)?;
        let added = self.write(|state| {
            let added = state.exclusions.insert(domain.clone());
            state.sync_exclusions();
            added
        })?;
        if added {
            info!(domain = %domain, "Domain excluded from tracking");
        }
        Ok(domain)
    }

    /// Removes a domain from the exclusion list.
    ///
    /// Returns `true` if the domain was listed.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be persisted.
    pub fn remove_excluded_domain(&self, raw: &str) -> Result<bool, SettingsError> {
        let domain = normalize_domain(raw).unwrap_or_else(|_| raw.trim().to_ascii_lowercase());
        let removed = self.write(|state| {
            let removed = state.exclusions.remove(&domain);
            state.sync_exclusions();
            removed
        })?;
        if removed {
            info!(domain = %domain, "Domain removed from exclusions");
        }
        Ok(removed)
    }

    /// Replaces the whole exclusion list. Invalid entries are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be persisted.
    pub fn set_excluded_domains<I, S>(&self, entries: I) -> Result<ExclusionList, SettingsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exclusions = ExclusionList::from_entries(entries);
        self.write(|state| {
            state.exclusions = exclusions.clone();
            state.sync_exclusions();
        })?;
        info!(count = exclusions.len(), "Exclusion list replaced");
        Ok(exclusions)
    }

    /// Re-reads settings from disk after an external edit.
    ///
    /// # Errors
    ///
    /// Returns an error for I/O failures other than a missing file.
    pub fn reload(&self) -> Result<ReloadOutcome, StorageError> {
        let fresh = SettingsState::new(read_settings(&self.storage)?);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let outcome = ReloadOutcome {
            exclusions_changed: state.exclusions != fresh.exclusions,
            tracking_changed: state.settings.tracking_enabled != fresh.settings.tracking_enabled,
        };
        *state = fresh;
        Ok(outcome)
    }

    fn read<R>(&self, f: impl FnOnce(&SettingsState) -> R) -> R {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Applies a mutation and persists the result while holding the lock.
    fn write<R>(&self, f: impl FnOnce(&mut SettingsState) -> R) -> Result<R, StorageError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut state);
        self.storage.set(SETTINGS_KEY, &state.settings)?;
        Ok(result)
    }
}

impl TrackingSwitch for SharedSettings {
    fn disable_tracking(&self, reason: &str) {
        let reason = reason.to_string();
        let result = self.write(|state| {
            state.settings.tracking_enabled = false;
            state.settings.auto_disabled_at = Some(Utc::now());
            state.settings.auto_disable_reason = Some(reason.clone());
        });
        match result {
            Ok(()) => warn!(reason = %reason, "Tracking disabled automatically"),
            Err(e) => warn!(error = %e, "Tracking disabled but settings could not be saved"),
        }
    }
}

fn read_settings(storage: &Storage) -> Result<Settings, StorageError> {
    match storage.get::<Settings>(SETTINGS_KEY) {
        Ok(settings) => Ok(settings.unwrap_or_default()),
        Err(StorageError::Corrupt { source, .. }) => {
            warn!(error = %source, "Settings document is corrupt, using defaults");
            Ok(Settings::default())
        }
        Err(e) => Err(e),
    }
}
