//! Tab activity tracking.
//!
//! [`TabTracker`] folds browser signals (tab activation and navigation,
//! window focus, idle state) into a single "currently attended domain" and
//! reports changes of that domain as [`DomainTransition`]s:
//!
//! - Switching from `a.com` to `b.com` yields `inactive(a.com)`, `active(b.com)`
//! - The browser losing focus, the user going idle or locked, or the active
//!   tab closing yields `inactive(current)`
//! - Navigating to a non-web page ends the current domain without starting one
//!
//! While disabled the tracker keeps following tabs but reports nothing.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::domain::domain_from_url;
use crate::types::EventType;

/// Maximum number of tabs remembered.
pub const TAB_CACHE_CAPACITY: usize = 512;

/// Browser tab identifier.
pub type TabId = i64;

/// Browser window identifier.
pub type WindowId = i64;

/// User presence as reported by the browser idle API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

/// A change of the attended domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainTransition {
    pub event_type: EventType,
    pub domain: String,
}

impl DomainTransition {
    fn active(domain: String) -> Self {
        Self {
            event_type: EventType::Active,
            domain,
        }
    }

    fn inactive(domain: String) -> Self {
        Self {
            event_type: EventType::Inactive,
            domain,
        }
    }
}

#[derive(Debug, Clone)]
struct TabState {
    window_id: Option<WindowId>,
    domain: Option<String>,
}

/// Tracks which domain has the user's attention.
#[derive(Debug)]
pub struct TabTracker {
    tabs: LruCache<TabId, TabState>,
    active_tabs: HashMap<WindowId, TabId>,
    focused_window: Option<WindowId>,
    idle: IdleState,
    enabled: bool,
    current: Option<String>,
}

impl Default for TabTracker {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TabTracker {
    /// Creates a tracker with no known tabs.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        let capacity = NonZeroUsize::new(TAB_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            tabs: LruCache::new(capacity),
            active_tabs: HashMap::new(),
            focused_window: None,
            idle: IdleState::Active,
            enabled,
            current: None,
        }
    }

    /// Domain currently reported as active, if any.
    #[must_use]
    pub fn current_domain(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Whether transitions are being reported.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of tabs remembered.
    #[must_use]
    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    /// A tab became the active tab of its window.
    pub fn tab_activated(
        &mut self,
        tab_id: TabId,
        window_id: WindowId,
        url: Option<&str>,
    ) -> Vec<DomainTransition> {
        let domain = match url {
            Some(url) => domain_from_url(url),
            // Keep what we learned from earlier updates.
            None => self.tabs.peek(&tab_id).and_then(|t| t.domain.clone()),
        };
        self.tabs.put(
            tab_id,
            TabState {
                window_id: Some(window_id),
                domain,
            },
        );
        self.active_tabs.insert(window_id, tab_id);
        if self.focused_window.is_none() {
            self.focused_window = Some(window_id);
        }
        self.recompute()
    }

    /// A tab navigated to `url`.
    pub fn tab_updated(&mut self, tab_id: TabId, url: &str) -> Vec<DomainTransition> {
        let domain = domain_from_url(url);
        match self.tabs.get_mut(&tab_id) {
            Some(tab) => tab.domain = domain,
            None => {
                self.tabs.put(
                    tab_id,
                    TabState {
                        window_id: None,
                        domain,
                    },
                );
            }
        }
        self.recompute()
    }

    /// A tab was closed.
    pub fn tab_removed(&mut self, tab_id: TabId) -> Vec<DomainTransition> {
        self.tabs.pop(&tab_id);
        self.active_tabs.retain(|_, active| *active != tab_id);
        self.recompute()
    }

    /// Window focus moved; `None` means the browser lost focus.
    pub fn window_focus_changed(&mut self, window_id: Option<WindowId>) -> Vec<DomainTransition> {
        self.focused_window = window_id;
        self.recompute()
    }

    /// The user became active, idle or locked the screen.
    pub fn idle_state_changed(&mut self, state: IdleState) -> Vec<DomainTransition> {
        self.idle = state;
        self.recompute()
    }

    /// Turns reporting on or off.
    ///
    /// Enabling reports the attended domain as active; disabling reports it
    /// as inactive.
    pub fn set_enabled(&mut self, enabled: bool) -> Vec<DomainTransition> {
        if self.enabled == enabled {
            return Vec::new();
        }
        self.enabled = enabled;
        self.recompute()
    }

    /// Forgets the current domain without reporting it.
    pub fn discard_current(&mut self) {
        self.current = None;
    }

    fn attended_domain(&self) -> Option<String> {
        if !self.enabled || self.idle != IdleState::Active {
            return None;
        }
        let window = self.focused_window?;
        let tab = self.active_tabs.get(&window)?;
        self.tabs.peek(tab)?.domain.clone()
    }

    fn recompute(&mut self) -> Vec<DomainTransition> {
        let target = self.attended_domain();
        if target == self.current {
            return Vec::new();
        }

        let mut transitions = Vec::with_capacity(2);
        if let Some(previous) = self.current.take() {
            transitions.push(DomainTransition::inactive(previous));
        }
        if let Some(next) = target.clone() {
            transitions.push(DomainTransition::active(next));
        }
        self.current = target;

        trace!(current = ?self.current, transitions = transitions.len(), "Attention changed");
        transitions
    }
}
