//! In-memory activity aggregation.
//!
//! Accepted events are folded into per-user, per-domain counters. Raw events
//! are not kept; `GET /activity` only needs the totals and the last time each
//! domain was seen.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::types::{ActivityResponse, DomainActivity, Event, EventType};

#[derive(Debug, Default)]
struct UserActivity {
    total_events: u64,
    domains: HashMap<String, DomainActivity>,
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, UserActivity>,
    total_events: u64,
}

/// Shared activity store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ActivityStore {
    inner: Arc<RwLock<Inner>>,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a batch of validated events to `email`'s totals.
    pub fn record(&self, email: &str, events: &[Event]) {
        if events.is_empty() {
            return;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let user = inner.users.entry(email.to_string()).or_default();

        for event in events {
            let entry = user
                .domains
                .entry(event.domain.clone())
                .or_insert_with(|| DomainActivity {
                    domain: event.domain.clone(),
                    active_count: 0,
                    inactive_count: 0,
                    last_seen: event.timestamp,
                });

            match event.event_type {
                EventType::Active => entry.active_count += 1,
                EventType::Inactive => entry.inactive_count += 1,
            }
            entry.last_seen = entry.last_seen.max(event.timestamp);
        }
        user.total_events += events.len() as u64;
        inner.total_events += events.len() as u64;

        trace!(email = %email, count = events.len(), "Recorded activity");
    }

    /// Returns `email`'s per-domain totals, busiest domain first.
    pub fn summary(&self, email: &str) -> ActivityResponse {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let (total_events, mut domains): (u64, Vec<DomainActivity>) = match inner.users.get(email) {
            Some(user) => (user.total_events, user.domains.values().cloned().collect()),
            None => (0, Vec::new()),
        };
        domains.sort_by(|a, b| {
            (b.active_count + b.inactive_count)
                .cmp(&(a.active_count + a.inactive_count))
                .then_with(|| a.domain.cmp(&b.domain))
        });

        ActivityResponse {
            email: email.to_string(),
            total_events,
            domains,
        }
    }

    /// Total events stored across all users.
    pub fn total_events(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .total_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn event(event_type: EventType, domain: &str, timestamp: &str) -> Event {
        Event {
            event_type,
            domain: domain.to_string(),
            timestamp: DateTime::parse_from_rfc3339(timestamp)
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn summary_counts_events_per_domain() {
        let store = ActivityStore::new();
        store.record(
            "ada@example.com",
            &[
                event(EventType::Active, "docs.rs", "2026-10-18T10:00:00Z"),
                event(EventType::Inactive, "docs.rs", "2026-10-18T10:05:00Z"),
                event(EventType::Active, "github.com", "2026-10-18T10:05:00Z"),
            ],
        );

        let summary = store.summary("ada@example.com");

        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.domains.len(), 2);
        let docs = &summary.domains[0];
        assert_eq!(docs.domain, "docs.rs");
        assert_eq!((docs.active_count, docs.inactive_count), (1, 1));
        assert_eq!(docs.last_seen.to_rfc3339(), "2026-10-18T10:05:00+00:00");
    }

    #[test]
    fn last_seen_ignores_out_of_order_events() {
        let store = ActivityStore::new();
        store.record("ada@example.com", &[event(EventType::Active, "a.com", "2026-10-18T12:00:00Z")]);
        store.record("ada@example.com", &[event(EventType::Inactive, "a.com", "2026-10-18T11:00:00Z")]);

        let summary = store.summary("ada@example.com");
        assert_eq!(summary.domains[0].last_seen.to_rfc3339(), "2026-10-18T12:00:00+00:00");
    }

    #[test]
    fn domains_are_sorted_by_activity_then_name() {
        let store = ActivityStore::new();
        store.record(
            "ada@example.com",
            &[
                event(EventType::Active, "b.com", "2026-10-18T10:00:00Z"),
                event(EventType::Active, "a.com", "2026-10-18T10:00:00Z"),
                event(EventType::Active, "c.com", "2026-10-18T10:00:00Z"),
                event(EventType::Inactive, "c.com", "2026-10-18T10:01:00Z"),
            ],
        );

        let order: Vec<String> = store
            .summary("ada@example.com")
            .domains
            .into_iter()
            .map(|d| d.domain)
            .collect();
        assert_eq!(order, vec!["c.com", "a.com", "b.com"]);
    }

    #[test]
    fn users_are_isolated() {
        let store = ActivityStore::new();
        store.record("ada@example.com", &[event(EventType::Active, "a.com", "2026-10-18T10:00:00Z")]);
        store.record("bob@example.com", &[event(EventType::Active, "b.com", "2026-10-18T10:00:00Z")]);

        let ada = store.summary("ada@example.com");
        assert_eq!(ada.domains.len(), 1);
        assert_eq!(ada.domains[0].domain, "a.com");
        assert_eq!(store.total_events(), 2);
    }

    #[test]
    fn unknown_user_has_empty_summary() {
        let summary = ActivityStore::new().summary("nobody@example.com");
        assert_eq!(summary.total_events, 0);
        assert!(summary.domains.is_empty());
    }

    #[test]
    fn empty_batch_creates_nothing() {
        let store = ActivityStore::new();
        store.record("ada@example.com", &[]);
        assert_eq!(store.total_events(), 0);
    }
}
