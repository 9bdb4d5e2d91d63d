//! Per-IP admission throttling using the token bucket algorithm.
//!
//! Applied as axum middleware in front of the stream endpoint, before the
//! lifecycle manager sees the request. Each source IP owns a bucket holding
//! up to `burst` tokens, refilled at `rate` tokens per second; each request
//! consumes one.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::GatewayError;

/// Buckets idle for longer than this are removed by the cleanup task.
pub const STALE_ENTRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The request may proceed.
    Allowed,
    /// The request is throttled.
    Limited {
        /// Seconds until a token is available (at least 1).
        retry_after_secs: u64,
    },
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(burst: u32) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, burst: u32) -> RateLimitResult {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(burst));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateLimitResult::Allowed;
        }
        let wait = if rate > 0.0 {
            ((1.0 - self.tokens) / rate).ceil()
        } else {
            STALE_ENTRY_TIMEOUT.as_secs_f64()
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let retry_after_secs = (wait as u64).max(1);
        RateLimitResult::Limited { retry_after_secs }
    }
}

/// Token-bucket limiter keyed by source IP.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, TokenBucket>>>,
    rate: f64,
    burst: u32,
}

impl RateLimiter {
    /// Creates a limiter refilling `rate` tokens per second up to `burst`.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            burst: burst.max(1),
        }
    }

    /// Consumes one token for `ip`.
    pub async fn check(&self, ip: IpAddr) -> RateLimitResult {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::full(self.burst))
            .try_consume(self.rate, self.burst)
    }

    /// Drops buckets idle for longer than `timeout`, returning how many.
    pub async fn cleanup_stale_entries(&self, timeout: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.last_refill.elapsed() < timeout);
        before.saturating_sub(buckets.len())
    }

    /// Number of tracked source IPs.
    pub async fn tracked_sources(&self) -> usize {
        self.buckets.lock().await.len()
    }

    /// Spawns a task pruning stale buckets every `interval`.
    pub fn spawn_cleanup_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup_stale_entries(STALE_ENTRY_TIMEOUT).await;
                if removed > 0 {
                    tracing::debug!(removed, "pruned stale rate limit buckets");
                }
            }
        })
    }
}

/// Axum middleware rejecting throttled source IPs with `429`.
///
/// Requests without connection info (e.g. in-process tests) pass through.
///
/// # Errors
///
/// Returns [`GatewayError::RateLimited`] when the source IP has no tokens.
pub async fn throttle(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    if let Some(ip) = ip
        && let RateLimitResult::Limited { retry_after_secs } = limiter.check(ip).await
    {
        tracing::warn!(%ip, retry_after_secs, "stream admission throttled");
        return Err(GatewayError::RateLimited { retry_after_secs });
    }
    Ok(next.run(request).await.into_response())
}
