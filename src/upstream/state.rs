//! Upstream connection state and the status published to watchers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

/// Lifecycle of the single upstream hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamConnectionState {
    /// Not running; `start()` has not been called or `stop()` completed.
    #[default]
    Disconnected,
    /// Opening the WebSocket.
    Connecting,
    /// Performing the hub auth handshake.
    Authenticating,
    /// Authenticated and subscribed; events are flowing.
    Subscribed,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Gave up. Terminal until `start()` is called again.
    Failed,
}

impl UpstreamConnectionState {
    /// Returns the state as a static string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribed => "subscribed",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UpstreamConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the upstream connection published on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStatus {
    /// Current state.
    pub state: UpstreamConnectionState,
    /// When the current subscription was established.
    pub subscribed_since: Option<DateTime<Utc>>,
    /// Failed cycles since the last successful subscription.
    pub reconnect_attempt: u32,
    /// Most recent connection error, if any.
    pub last_error: Option<String>,
}

impl UpstreamStatus {
    /// Time spent subscribed on the current connection.
    ///
    /// Returns `None` unless the state is [`UpstreamConnectionState::Subscribed`].
    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        if self.state != UpstreamConnectionState::Subscribed {
            return None;
        }
        self.subscribed_since
            .and_then(|since| (Utc::now() - since).to_std().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disconnected() {
        let status = UpstreamStatus::default();
        assert_eq!(status.state, UpstreamConnectionState::Disconnected);
        assert!(status.uptime().is_none());
    }

    #[test]
    fn uptime_only_while_subscribed() {
        let mut status = UpstreamStatus {
            state: UpstreamConnectionState::Subscribed,
            subscribed_since: Some(Utc::now() - chrono::Duration::seconds(5)),
            ..UpstreamStatus::default()
        };
        assert!(status.uptime().is_some_and(|d| d >= Duration::from_secs(5)));
        status.state = UpstreamConnectionState::Reconnecting;
        assert!(status.uptime().is_none());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&UpstreamConnectionState::Reconnecting).ok();
        assert_eq!(json.as_deref(), Some("\"reconnecting\""));
    }
}
