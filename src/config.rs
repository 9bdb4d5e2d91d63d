//! Gateway configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Missing or unparsable values fall back
//! to defaults, except `LISTEN_ADDR` which must parse when set.

use std::net::SocketAddr;
use std::time::Duration;

use crate::upstream::ReconnectPolicy;

/// Upstream hub connection settings.
#[derive(Clone)]
pub struct UpstreamConfig {
    /// Hub WebSocket URL (e.g. `ws://homeassistant.local:8123/api/websocket`).
    pub url: String,
    /// Long-lived access token presented during the hub auth handshake.
    pub access_token: String,
    /// Event types to subscribe to; empty subscribes to every event.
    pub event_types: Vec<String>,
    /// Interval between heartbeat pings while subscribed. `Duration::ZERO`
    /// disables pings and the silence check.
    pub heartbeat_interval: Duration,
    /// Timeout for the TCP/WebSocket connect and each handshake step.
    pub connect_timeout: Duration,
    /// Reconnect backoff policy.
    pub reconnect: ReconnectPolicy,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url)
            .field("access_token", &"<redacted>")
            .field("event_types", &self.event_types)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8123/api/websocket".to_string(),
            access_token: String::new(),
            event_types: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Downstream fan-out settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum concurrently registered stream clients.
    pub max_clients: usize,
    /// Per-client outbound queue capacity, in frames.
    pub client_buffer_capacity: usize,
    /// Consecutive full-buffer drops tolerated before a client is removed.
    /// `0` removes a client on its first full buffer.
    pub max_consecutive_drops: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_clients: 100,
            client_buffer_capacity: 256,
            max_consecutive_drops: 0,
        }
    }
}

/// Top-level gateway configuration.
///
/// Loaded once at startup via [`GatewayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:3000`).
    pub listen_addr: SocketAddr,

    /// Upstream hub connection.
    pub upstream: UpstreamConfig,

    /// Fan-out limits.
    pub hub: HubConfig,

    /// Interval between SSE keep-alive comments.
    pub sse_keepalive: Duration,

    /// Bearer tokens accepted on the stream endpoint.
    pub access_tokens: Vec<String>,

    /// Stream admissions refilled per second per source IP.
    pub rate_limit_per_sec: f64,

    /// Burst of stream admissions allowed per source IP.
    pub rate_limit_burst: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            upstream: UpstreamConfig::default(),
            hub: HubConfig::default(),
            sse_keepalive: Duration::from_secs(15),
            access_tokens: Vec::new(),
            rate_limit_per_sec: 1.0,
            rate_limit_burst: 10,
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `LISTEN_ADDR` is set but cannot be parsed as
    /// a [`SocketAddr`].
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let listen_addr: SocketAddr = std::env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse()?;

        let defaults = UpstreamConfig::default();
        let reconnect = ReconnectPolicy {
            enabled: parse_env_bool("RECONNECT_ENABLED", defaults.reconnect.enabled),
            base_delay: Duration::from_millis(parse_env("RECONNECT_BASE_DELAY_MS", 1_000)),
            max_delay: Duration::from_millis(parse_env("RECONNECT_MAX_DELAY_MS", 30_000)),
            max_attempts: parse_env("RECONNECT_MAX_ATTEMPTS", defaults.reconnect.max_attempts),
        };
        let upstream = UpstreamConfig {
            url: std::env::var("HUB_WS_URL").unwrap_or(defaults.url),
            access_token: std::env::var("HUB_ACCESS_TOKEN").unwrap_or_default(),
            event_types: parse_env_list("HUB_EVENT_TYPES"),
            heartbeat_interval: Duration::from_secs(parse_env("HUB_HEARTBEAT_SECS", 30)),
            connect_timeout: Duration::from_secs(parse_env("HUB_CONNECT_TIMEOUT_SECS", 10)),
            reconnect,
        };

        let hub_defaults = HubConfig::default();
        let hub = HubConfig {
            max_clients: parse_env("MAX_CLIENTS", hub_defaults.max_clients),
            client_buffer_capacity: parse_env(
                "CLIENT_BUFFER_CAPACITY",
                hub_defaults.client_buffer_capacity,
            ),
            max_consecutive_drops: parse_env(
                "CLIENT_MAX_CONSECUTIVE_DROPS",
                hub_defaults.max_consecutive_drops,
            ),
        };

        Ok(Self {
            listen_addr,
            upstream,
            hub,
            sse_keepalive: Duration::from_secs(parse_env("SSE_KEEPALIVE_SECS", 15)),
            access_tokens: parse_env_list("ACCESS_TOKENS"),
            rate_limit_per_sec: parse_env("RATE_LIMIT_PER_SEC", 1.0),
            rate_limit_burst: parse_env("RATE_LIMIT_BURST", 10),
        })
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|v| v.to_ascii_lowercase())
        .as_deref()
    {
        Some("true" | "1") => true,
        Some("false" | "0") => false,
        _ => default,
    }
}

/// Parses a comma-separated environment variable, skipping blank items.
fn parse_env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| split_list(&v))
        .unwrap_or_default()
}

/// Splits a comma-separated list, trimming items and skipping blanks.
pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
