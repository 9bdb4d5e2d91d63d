//! Shared application state injected into all Axum handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::rate_limit::RateLimiter;
use crate::service::Gateway;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Running core: upstream source and client lifecycle.
    pub gateway: Arc<Gateway>,
    /// Per-IP admission throttle for the stream endpoint.
    pub rate_limiter: RateLimiter,
    /// Interval between SSE keep-alive comments.
    pub sse_keepalive: Duration,
}
