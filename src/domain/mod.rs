//! Domain layer: events, clients, filters, and the subscription registry.
//!
//! Everything here is pure data and synchronous logic. Network I/O lives in
//! [`crate::upstream`] and [`crate::api`].

pub mod client;
pub mod client_id;
pub mod event;
pub mod filter;
pub mod frame;
pub mod registry;

pub use client::{Client, ClientSink, SendError};
pub use client_id::ClientId;
pub use event::{Event, domain_of};
pub use filter::Filter;
pub use frame::Frame;
pub use registry::{RegistryError, SubscriptionRegistry};
