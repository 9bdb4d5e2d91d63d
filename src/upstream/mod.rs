//! Upstream layer: the hub WebSocket connection and its state machine.
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Subscribed
//!                    ↑                              │ transport error
//!                    └──── Reconnecting ←───────────┘
//!                              │ attempts exhausted / token rejected
//!                              ↓
//!                            Failed
//! ```

pub mod backoff;
pub mod protocol;
pub mod source;
pub mod state;

pub use backoff::{Backoff, ReconnectPolicy};
pub use source::{EventHandler, UpstreamError, UpstreamEventSource};
pub use state::{UpstreamConnectionState, UpstreamStatus};
