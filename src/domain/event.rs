//! Normalized hub events.
//!
//! Every upstream notification becomes one [`Event`]. The entity domain is
//! derived exactly once, at construction, so filters and statistics always
//! see the same value for a given entity id.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single normalized state/notification record from the upstream hub.
///
/// Created per upstream message, consumed once by the fan-out pass and then
/// discarded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Hub event type (e.g. `"state_changed"`).
    #[serde(rename = "type")]
    event_type: String,
    /// Entity that the event concerns, if any.
    entity_id: Option<String>,
    /// Prefix of `entity_id` before the first `.`.
    domain: Option<String>,
    /// Event body as received from the hub.
    #[serde(rename = "data")]
    payload: serde_json::Value,
    /// Time the hub fired the event, or ingestion time when unknown.
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Builds an event, deriving its domain from `entity_id`.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        entity_id: Option<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let domain = entity_id.as_deref().map(|id| domain_of(id).to_string());
        Self {
            event_type: event_type.into(),
            entity_id,
            domain,
            payload,
            timestamp,
        }
    }

    /// Returns the event type.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Returns the entity id, if the event concerns an entity.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    /// Returns the entity domain, if the event concerns an entity.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Returns the raw event body.
    #[must_use]
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Returns the event timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Returns the domain of an entity id: everything before the first `.`.
///
/// An id without a separator is its own domain.
#[must_use]
pub fn domain_of(entity_id: &str) -> &str {
    entity_id
        .split_once('.')
        .map_or(entity_id, |(domain, _)| domain)
}
