//! Service layer: admission, fan-out and process wiring.
//!
//! [`BroadcastHub`] consumes upstream events and delivers them to matching
//! clients. [`ClientLifecycleManager`] is the contract the routes use, and
//! [`Gateway`] ties both to the [`crate::upstream::UpstreamEventSource`].

pub mod broadcast_hub;
pub mod gateway;
pub mod lifecycle;
pub mod statistics;

pub use broadcast_hub::{Admitted, BroadcastHub, ClientConnection, DispatchOutcome};
pub use gateway::Gateway;
pub use lifecycle::{ClientLifecycleManager, ClientSession, ClientStream, DisconnectGuard};
pub use statistics::{ClientStatistics, Statistics};
