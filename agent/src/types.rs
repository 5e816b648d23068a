//! Event types for TabPulse activity tracking.
//!
//! This module defines the event schema shared between the agent and the
//! ingest backend. Events serialize to camelCase JSON with RFC 3339 timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a domain gained or lost the user's attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Active,
    Inactive,
}

impl EventType {
    /// Returns the wire name of this event type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tab activity event.
///
/// Created when a tab becomes active or inactive on a tracked domain. Events
/// are immutable once created and leave the queue only when delivered or
/// evicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Whether the domain became active or inactive.
    pub event_type: EventType,

    /// Normalized hostname the event refers to.
    pub domain: String,

    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates a new event stamped with the current time.
    ///
    /// # Examples
    ///
    /// ```
    /// use tabpulse_agent::types::{Event, EventType};
    ///
    /// let event = Event::new(EventType::Active, "example.com".to_string());
    /// assert_eq!(event.domain, "example.com");
    /// assert_eq!(event.event_type, EventType::Active);
    /// ```
    #[must_use]
    pub fn new(event_type: EventType, domain: String) -> Self {
        Self::at(event_type, domain, Utc::now())
    }

    /// Creates an event with an explicit timestamp.
    #[must_use]
    pub fn at(event_type: EventType, domain: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            domain,
            timestamp,
        }
    }
}

/// Per-domain totals reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainActivity {
    pub domain: String,
    pub active_count: u64,
    pub inactive_count: u64,
    pub last_seen: DateTime<Utc>,
}

/// The signed-in user's activity summary, busiest domain first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub email: String,
    pub total_events: u64,
    pub domains: Vec<DomainActivity>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_type_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventType::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::Inactive).unwrap(),
            "\"inactive\""
        );
    }

    #[test]
    fn event_serializes_with_camel_case_fields() {
        let timestamp = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let event = Event::at(EventType::Inactive, "example.com".to_string(), timestamp);

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["eventType"], "inactive");
        assert_eq!(json["domain"], "example.com");
        assert_eq!(json["timestamp"], "2026-03-01T12:30:00Z");
    }

    #[test]
    fn event_deserializes_from_wire_format() {
        let json = r#"{"eventType":"active","domain":"rust-lang.org","timestamp":"2026-01-02T03:04:05.678Z"}"#;

        let event: Event = serde_json::from_str(json).unwrap();

        assert_eq!(event.event_type, EventType::Active);
        assert_eq!(event.domain, "rust-lang.org");
        assert_eq!(event.timestamp.timestamp_subsec_millis(), 678);
    }

    #[test]
    fn event_type_display_matches_wire_name() {
        assert_eq!(EventType::Active.to_string(), "active");
        assert_eq!(EventType::Inactive.to_string(), "inactive");
    }

    #[test]
    fn activity_summary_reads_camel_case() {
        let json = r#"{
            "email": "ada@example.com",
            "totalEvents": 3,
            "domains": [
                {"domain": "docs.rs", "activeCount": 2, "inactiveCount": 1, "lastSeen": "2026-10-18T10:05:00Z"}
            ]
        }"#;

        let summary: ActivitySummary = serde_json::from_str(json).unwrap();

        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.domains[0].active_count, 2);
        assert_eq!(summary.domains[0].last_seen.to_rfc3339(), "2026-10-18T10:05:00+00:00");
    }
}
