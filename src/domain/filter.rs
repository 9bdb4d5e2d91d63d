//! Per-client subscription filter.
//!
//! A [`Filter`] is the union of three independently-built criteria sets.
//! Each subscribe call only ever adds to one set, and an event passes if it
//! satisfies any non-empty set. A filter with all sets empty passes every
//! event.

use std::collections::BTreeSet;

use serde::Serialize;

use super::Event;

/// Event-type, entity-id and domain criteria for one client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Filter {
    /// Event types the client asked for (`"state_changed"`, …).
    #[serde(rename = "events")]
    event_types: BTreeSet<String>,
    /// Exact entity ids the client asked for.
    #[serde(rename = "entities")]
    entity_ids: BTreeSet<String>,
    /// Entity domains the client asked for (`"light"`, …).
    domains: BTreeSet<String>,
}

impl Filter {
    /// Creates an empty (subscribe-all) filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event-type criterion. Returns `false` if already present.
    pub fn add_event_type(&mut self, event_type: impl Into<String>) -> bool {
        self.event_types.insert(event_type.into())
    }

    /// Adds an entity-id criterion. Returns `false` if already present.
    pub fn add_entity_id(&mut self, entity_id: impl Into<String>) -> bool {
        self.entity_ids.insert(entity_id.into())
    }

    /// Adds a domain criterion. Returns `false` if already present.
    pub fn add_domain(&mut self, domain: impl Into<String>) -> bool {
        self.domains.insert(domain.into())
    }

    /// Returns `true` if no criterion has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event_types.is_empty() && self.entity_ids.is_empty() && self.domains.is_empty()
    }

    /// Returns `true` if the event passes this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if self.is_empty() {
            return true;
        }
        self.event_types.contains(event.event_type())
            || event
                .entity_id()
                .is_some_and(|id| self.entity_ids.contains(id))
            || event.domain().is_some_and(|d| self.domains.contains(d))
    }

    /// Subscribed event types.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.event_types.iter().map(String::as_str)
    }

    /// Subscribed entity ids.
    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.entity_ids.iter().map(String::as_str)
    }

    /// Subscribed domains.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn event(event_type: &str, entity_id: Option<&str>) -> Event {
        Event::new(
            event_type,
            entity_id.map(str::to_string),
            serde_json::Value::Null,
            Utc::now(),
        )
    }

    #[test]
    fn empty_matches_everything() {
        let filter = Filter::new();
        assert!(filter.matches(&event("state_changed", Some("light.a"))));
        assert!(filter.matches(&event("call_service", None)));
    }

    #[test]
    fn domain_filter_matches_only_that_domain() {
        let mut filter = Filter::new();
        filter.add_domain("light");
        assert!(filter.matches(&event("state_changed", Some("light.living_room"))));
        assert!(!filter.matches(&event("state_changed", Some("switch.fan"))));
        assert!(!filter.matches(&event("state_changed", None)));
    }

    #[test]
    fn criteria_are_any_of() {
        let mut filter = Filter::new();
        filter.add_event_type("automation_triggered");
        filter.add_entity_id("switch.fan");
        assert!(filter.matches(&event("automation_triggered", None)));
        assert!(filter.matches(&event("state_changed", Some("switch.fan"))));
        assert!(!filter.matches(&event("state_changed", Some("switch.heater"))));
    }

    #[test]
    fn duplicate_criteria_are_ignored() {
        let mut filter = Filter::new();
        assert!(filter.add_domain("climate"));
        assert!(!filter.add_domain("climate"));
        assert_eq!(filter.domains().count(), 1);
    }

    #[test]
    fn serializes_with_subscription_keys() {
        let mut filter = Filter::new();
        filter.add_event_type("state_changed");
        let Ok(value) = serde_json::to_value(&filter) else {
            panic!("serialization failed");
        };
        assert_eq!(
            value,
            serde_json::json!({"events": ["state_changed"], "entities": [], "domains": []})
        );
    }
}
