//! Hub WebSocket wire protocol.
//!
//! Message flow on every connection:
//!
//! ```text
//! hub    → {"type":"auth_required"}
//! client → {"type":"auth","access_token":"…"}
//! hub    → {"type":"auth_ok"} | {"type":"auth_invalid","message":"…"}
//! client → {"id":1,"type":"subscribe_events","event_type":"…"?}
//! hub    → {"id":1,"type":"result","success":true}
//! hub    → {"id":1,"type":"event","event":{"event_type":…,"data":…,"time_fired":…}}
//! client → {"id":n,"type":"ping"}        hub → {"id":n,"type":"pong"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Event;

/// Frames sent by the gateway to the hub.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound<'a> {
    /// Auth handshake reply.
    Auth {
        /// Hub access token.
        access_token: &'a str,
    },
    /// Event subscription; no `event_type` subscribes to everything.
    SubscribeEvents {
        /// Correlation id.
        id: u64,
        /// Event type to subscribe to.
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<&'a str>,
    },
    /// Heartbeat.
    Ping {
        /// Correlation id.
        id: u64,
    },
}

impl Outbound<'_> {
    /// Serializes the frame to JSON text.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Error object attached to a failed `result`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HubError {
    /// Hub error code.
    #[serde(default)]
    pub code: String,
    /// Hub error message.
    #[serde(default)]
    pub message: String,
}

/// Event body of an `event` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HubEvent {
    /// Event type, e.g. `"state_changed"`.
    pub event_type: String,
    /// Event data; carries `entity_id` for entity events.
    #[serde(default)]
    pub data: serde_json::Value,
    /// RFC 3339 time the hub fired the event.
    #[serde(default)]
    pub time_fired: Option<String>,
}

impl HubEvent {
    /// Normalizes the hub event into an [`Event`].
    ///
    /// The timestamp is taken from `time_fired` when it parses, otherwise
    /// the ingestion time.
    #[must_use]
    pub fn into_event(self) -> Event {
        let entity_id = self
            .data
            .get("entity_id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        let timestamp = self
            .time_fired
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map_or_else(Utc::now, |t| t.with_timezone(&Utc));
        Event::new(self.event_type, entity_id, self.data, timestamp)
    }
}

/// Frames received from the hub.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Hub asks for credentials.
    AuthRequired {
        /// Hub version string.
        #[serde(default)]
        ha_version: Option<String>,
    },
    /// Credentials accepted.
    AuthOk {
        /// Hub version string.
        #[serde(default)]
        ha_version: Option<String>,
    },
    /// Credentials rejected.
    AuthInvalid {
        /// Rejection reason.
        #[serde(default)]
        message: Option<String>,
    },
    /// Command result.
    Result {
        /// Correlation id.
        id: u64,
        /// Whether the command succeeded.
        success: bool,
        /// Failure details.
        #[serde(default)]
        error: Option<HubError>,
    },
    /// Subscribed event.
    Event {
        /// Subscription id.
        id: u64,
        /// Event body.
        event: HubEvent,
    },
    /// Heartbeat reply.
    Pong {
        /// Correlation id.
        id: u64,
    },
    /// Any frame type the gateway does not act on.
    #[serde(other)]
    Unknown,
}

impl Inbound {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] for invalid JSON or a known frame
    /// type with missing fields.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Short name of the frame type, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AuthRequired { .. } => "auth_required",
            Self::AuthOk { .. } => "auth_ok",
            Self::AuthInvalid { .. } => "auth_invalid",
            Self::Result { .. } => "result",
            Self::Event { .. } => "event",
            Self::Pong { .. } => "pong",
            Self::Unknown => "unknown",
        }
    }
}

/// Monotonic correlation ids, starting at 1.
#[derive(Debug, Default)]
pub struct MessageIds(u64);

impl MessageIds {
    /// Returns the next id.
    pub fn next_id(&mut self) -> u64 {
        self.0 = self.0.saturating_add(1);
        self.0
    }
}
