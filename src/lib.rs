//! # hub-event-gateway
//!
//! Real-time event distribution for a home-automation hub.
//!
//! The gateway holds one authenticated WebSocket subscription to the hub's
//! event bus and fans every event out to any number of Server-Sent Events
//! clients, each with its own filter on event type, entity id or domain.
//! A slow or broken client is removed without delaying anyone else.
//!
//! ## Architecture
//!
//! ```text
//! Hub (WebSocket)
//!     │
//!     ├── UpstreamEventSource (upstream/)
//!     │       auth → subscribe → read loop, backoff reconnect
//!     │
//!     ├── BroadcastHub (service/)
//!     │       filter match → bounded per-client queue
//!     ├── SubscriptionRegistry (domain/)
//!     │
//!     ├── ClientLifecycleManager (service/)
//!     │       admission: AuthGate (auth) + capacity
//!     │
//!     └── SSE + stats handlers (api/), RateLimiter middleware
//!             │
//!         Clients (HTTP)
//! ```

pub mod api;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod domain;
pub mod error;
pub mod rate_limit;
pub mod service;
pub mod upstream;
