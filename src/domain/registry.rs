//! Client subscription registry.
//!
//! [`SubscriptionRegistry`] is the single shared mutable structure between
//! the upstream read loop and the per-client stream tasks. Every mutation
//! takes the exclusive lock; readers take a [`snapshot`] of `Arc<Client>`
//! handles so no lock is held while frames are delivered.
//!
//! Filter changes are copy-on-write: the entry is replaced by an updated
//! clone, so snapshots already handed out keep seeing a consistent filter.
//!
//! [`snapshot`]: SubscriptionRegistry::snapshot

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{Client, ClientId, Event};

/// Errors raised by registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The registry already holds the configured maximum of clients.
    #[error("client capacity of {max} reached")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },
    /// A client with the same id is already registered.
    #[error("client {0} already registered")]
    Duplicate(ClientId),
    /// No client with the given id is registered.
    #[error("client {0} not registered")]
    UnknownClient(ClientId),
}

/// Capacity-bounded map of client id to client record.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    max_clients: usize,
}

impl SubscriptionRegistry {
    /// Creates an empty registry admitting at most `max_clients` clients.
    #[must_use]
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            max_clients,
        }
    }

    /// Inserts a client. The capacity check and insert are one critical
    /// section, so the registry never grows past its maximum.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityExceeded`] when full and
    /// [`RegistryError::Duplicate`] if the id is already present.
    pub fn register(&self, client: Client) -> Result<(), RegistryError> {
        let mut map = self.write();
        if map.len() >= self.max_clients {
            return Err(RegistryError::CapacityExceeded {
                max: self.max_clients,
            });
        }
        let id = client.id();
        if map.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        map.insert(id, Arc::new(client));
        Ok(())
    }

    /// Builds and inserts a client under a freshly generated id that is not
    /// in use, returning the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityExceeded`] when full; `build` is not
    /// called in that case.
    pub fn register_new<F>(&self, build: F) -> Result<Arc<Client>, RegistryError>
    where
        F: FnOnce(ClientId) -> Client,
    {
        let mut map = self.write();
        if map.len() >= self.max_clients {
            return Err(RegistryError::CapacityExceeded {
                max: self.max_clients,
            });
        }
        let mut id = ClientId::new();
        while map.contains_key(&id) {
            id = ClientId::new();
        }
        let client = Arc::new(build(id));
        map.insert(id, Arc::clone(&client));
        Ok(client)
    }

    /// Removes a client and closes its sink.
    ///
    /// Returns `None` if the client was not registered, which makes repeated
    /// removal a no-op.
    pub fn unregister(&self, id: ClientId) -> Option<Arc<Client>> {
        let mut map = self.write();
        let client = map.remove(&id)?;
        client.sink().close();
        Some(client)
    }

    /// Adds an event-type criterion to a client's filter.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownClient`] if the client is not registered.
    pub fn add_event_filter(&self, id: ClientId, event_type: &str) -> Result<(), RegistryError> {
        self.update(id, |client| {
            client.filter_mut().add_event_type(event_type);
        })
    }

    /// Adds an entity-id criterion to a client's filter.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownClient`] if the client is not registered.
    pub fn add_entity_filter(&self, id: ClientId, entity_id: &str) -> Result<(), RegistryError> {
        self.update(id, |client| {
            client.filter_mut().add_entity_id(entity_id);
        })
    }

    /// Adds a domain criterion to a client's filter.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownClient`] if the client is not registered.
    pub fn add_domain_filter(&self, id: ClientId, domain: &str) -> Result<(), RegistryError> {
        self.update(id, |client| {
            client.filter_mut().add_domain(domain);
        })
    }

    /// Returns `true` if the client is registered and its filter passes the
    /// event.
    #[must_use]
    pub fn matches(&self, id: ClientId, event: &Event) -> bool {
        self.read()
            .get(&id)
            .is_some_and(|client| client.filter().matches(event))
    }

    /// Returns the current client record.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.read().get(&id).map(Arc::clone)
    }

    /// Returns a point-in-time copy of every registered client.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.read().values().map(Arc::clone).collect()
    }

    /// Removes every client, closing their sinks.
    pub fn drain(&self) -> Vec<Arc<Client>> {
        let mut map = self.write();
        let drained: Vec<_> = map.drain().map(|(_, client)| client).collect();
        for client in &drained {
            client.sink().close();
        }
        drained
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no client is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Configured maximum number of clients.
    #[must_use]
    pub const fn max_clients(&self) -> usize {
        self.max_clients
    }

    fn update<F>(&self, id: ClientId, apply: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Client),
    {
        let mut map = self.write();
        let entry = map.get_mut(&id).ok_or(RegistryError::UnknownClient(id))?;
        apply(Arc::make_mut(entry));
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ClientId, Arc<Client>>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ClientId, Arc<Client>>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }
}
