//! Client admission and disconnect handling for the route layer.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use super::broadcast_hub::{BroadcastHub, ClientConnection};
use super::statistics::Statistics;
use crate::domain::{Client, ClientId, Frame, RegistryError};
use crate::error::AdmissionError;

/// Public contract used by the stream routes.
#[derive(Debug, Clone)]
pub struct ClientLifecycleManager {
    hub: Arc<BroadcastHub>,
}

impl ClientLifecycleManager {
    /// Wraps a hub.
    #[must_use]
    pub const fn new(hub: Arc<BroadcastHub>) -> Self {
        Self { hub }
    }

    /// The wrapped hub.
    #[must_use]
    pub const fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Admits a connection and returns its session.
    ///
    /// Dropping the session removes the client.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] if the token is rejected or the hub is
    /// at capacity.
    pub fn add(
        &self,
        connection: ClientConnection,
        token: &str,
    ) -> Result<ClientSession, AdmissionError> {
        let admitted = self.hub.admit(connection, token)?;
        let guard = DisconnectGuard {
            hub: Arc::clone(&self.hub),
            id: admitted.client.id(),
        };
        Ok(ClientSession {
            client: admitted.client,
            frames: admitted.frames,
            guard,
        })
    }

    /// Removes a client. Repeated calls are no-ops.
    pub fn remove(&self, id: ClientId) -> bool {
        self.hub.remove(id)
    }

    /// Adds an event-type criterion to a registered client.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownClient`] if the client is gone.
    pub fn add_event_filter(&self, id: ClientId, event_type: &str) -> Result<(), RegistryError> {
        self.hub.registry().add_event_filter(id, event_type)
    }

    /// Adds an entity-id criterion to a registered client.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownClient`] if the client is gone.
    pub fn add_entity_filter(&self, id: ClientId, entity_id: &str) -> Result<(), RegistryError> {
        self.hub.registry().add_entity_filter(id, entity_id)
    }

    /// Adds a domain criterion to a registered client.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownClient`] if the client is gone.
    pub fn add_domain_filter(&self, id: ClientId, domain: &str) -> Result<(), RegistryError> {
        self.hub.registry().add_domain_filter(id, domain)
    }

    /// Current hub statistics.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.hub.statistics()
    }

    /// Removes every client. Their streams end once drained.
    pub fn shutdown(&self) -> usize {
        self.hub.remove_all()
    }
}

/// Removes its client from the hub when dropped.
pub struct DisconnectGuard {
    hub: Arc<BroadcastHub>,
    id: ClientId,
}

impl fmt::Debug for DisconnectGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectGuard")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.hub.remove(self.id) {
            tracing::debug!(client = %self.id, "stream closed by client");
        }
    }
}

/// An admitted client, its frame queue and its disconnect guard.
#[derive(Debug)]
pub struct ClientSession {
    client: Arc<Client>,
    frames: mpsc::Receiver<Frame>,
    guard: DisconnectGuard,
}

impl ClientSession {
    /// Client id.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.client.id()
    }

    /// Registry record as of admission.
    #[must_use]
    pub const fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Converts the session into a frame stream that starts with the
    /// connection handshake.
    #[must_use]
    pub fn into_stream(self) -> ClientStream {
        let current = self
            .guard
            .hub
            .registry()
            .get(self.client.id())
            .unwrap_or(self.client);
        let handshake = Frame::connection(current.id(), current.authenticated(), current.filter());
        ClientStream {
            handshake: Some(handshake),
            frames: self.frames,
            _guard: self.guard,
        }
    }
}

/// Handshake frame followed by every delivered frame; ends when the client
/// is removed and its queue is drained.
#[derive(Debug)]
pub struct ClientStream {
    handshake: Option<Frame>,
    frames: mpsc::Receiver<Frame>,
    _guard: DisconnectGuard,
}

impl Stream for ClientStream {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        let this = self.get_mut();
        if let Some(frame) = this.handshake.take() {
            return Poll::Ready(Some(frame));
        }
        this.frames.poll_recv(cx)
    }
}
