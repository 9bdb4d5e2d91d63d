//! Serialized stream frames.
//!
//! A [`Frame`] is one JSON document destined for the `data:` line of an SSE
//! message. Event frames are serialized once per dispatch and shared by
//! every receiving client.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use super::{ClientId, Event, Filter};

/// An immutable, cheaply clonable JSON frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    /// Serializes a hub event as `{type, entity_id, domain, data, timestamp}`.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the payload cannot be serialized.
    pub fn event(event: &Event) -> Result<Self, serde_json::Error> {
        serde_json::to_string(event).map(Self::from)
    }

    /// Builds the handshake frame sent first on every admitted stream.
    #[must_use]
    pub fn connection(id: ClientId, authenticated: bool, filter: &Filter) -> Self {
        let body = serde_json::json!({
            "type": "connection",
            "status": "connected",
            "id": id,
            "authenticated": authenticated,
            "subscriptions": filter,
            "timestamp": Utc::now(),
        });
        Self::from(body.to_string())
    }

    /// Builds an error frame `{type: "error", message, timestamp}`.
    #[must_use]
    pub fn error(message: &str) -> Self {
        let body = serde_json::json!({
            "type": "error",
            "message": message,
            "timestamp": Utc::now(),
        });
        Self::from(body.to_string())
    }

    /// Returns the frame JSON.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Frame {
    fn from(json: String) -> Self {
        Self(Arc::from(json))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
