//! Fan-out of upstream events to registered stream clients.
//!
//! [`BroadcastHub`] pairs the [`SubscriptionRegistry`] with admission
//! (auth + capacity) and the dispatch pass. Dispatch never waits on a
//! client: each delivery is a `try_send` into the client's bounded queue,
//! and a client that is gone or too slow is removed on the spot while the
//! pass continues with the next one.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};

use super::statistics::{ClientStatistics, Statistics};
use crate::auth::AuthGate;
use crate::config::HubConfig;
use crate::domain::{
    Client, ClientId, ClientSink, Event, Filter, Frame, RegistryError, SendError,
    SubscriptionRegistry,
};
use crate::error::AdmissionError;
use crate::upstream::{EventHandler, UpstreamStatus};

/// Transport-side description of a connection asking for admission.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    /// Remote address of the connection.
    pub source_ip: IpAddr,
    /// Criteria requested when the stream was opened.
    pub filter: Filter,
}

/// A freshly admitted client and the receiving end of its queue.
#[derive(Debug)]
pub struct Admitted {
    /// The registered record.
    pub client: Arc<Client>,
    /// Frames to forward to the transport, in order.
    pub frames: mpsc::Receiver<Frame>,
}

/// Per-pass delivery counts returned by [`BroadcastHub::dispatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Clients whose filter matched.
    pub matched: usize,
    /// Frames enqueued.
    pub delivered: usize,
    /// Frames dropped on a full queue.
    pub dropped: usize,
    /// Clients removed during the pass.
    pub evicted: usize,
}

#[derive(Debug, Default)]
struct Counters {
    events: AtomicU64,
    deliveries: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

/// Registry plus admission and fan-out.
pub struct BroadcastHub {
    registry: SubscriptionRegistry,
    auth: Arc<dyn AuthGate>,
    config: HubConfig,
    upstream: watch::Receiver<UpstreamStatus>,
    counters: Counters,
}

impl fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl BroadcastHub {
    /// Creates a hub. `upstream` feeds the upstream section of
    /// [`statistics`](Self::statistics).
    #[must_use]
    pub fn new(
        config: HubConfig,
        auth: Arc<dyn AuthGate>,
        upstream: watch::Receiver<UpstreamStatus>,
    ) -> Self {
        Self {
            registry: SubscriptionRegistry::new(config.max_clients),
            auth,
            config,
            upstream,
            counters: Counters::default(),
        }
    }

    /// The underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Admits a connection: auth check, then capacity check, then register.
    ///
    /// A rejected attempt leaves the registry untouched.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Unauthorized`] if the auth gate rejects the
    /// token and [`AdmissionError::CapacityExceeded`] if the registry is full.
    pub fn admit(
        &self,
        connection: ClientConnection,
        token: &str,
    ) -> Result<Admitted, AdmissionError> {
        let ClientConnection { source_ip, filter } = connection;
        let verdict = self.auth.validate(token, source_ip);
        if !verdict.valid {
            let reason = verdict.error.unwrap_or_else(|| "invalid token".to_string());
            tracing::warn!(%source_ip, %reason, "stream admission rejected");
            return Err(AdmissionError::Unauthorized(reason));
        }

        let (sink, frames) = ClientSink::channel(self.config.client_buffer_capacity);
        let sink = Arc::new(sink);
        let client = self
            .registry
            .register_new(|id| Client::new(id, source_ip, true, filter, sink))
            .map_err(|err| {
                let max = match err {
                    RegistryError::CapacityExceeded { max } => max,
                    RegistryError::Duplicate(_) | RegistryError::UnknownClient(_) => {
                        self.registry.max_clients()
                    }
                };
                tracing::warn!(%source_ip, max, "stream admission rejected: at capacity");
                AdmissionError::CapacityExceeded { max }
            })?;

        tracing::info!(
            client = %client.id(),
            %source_ip,
            clients = self.registry.len(),
            "stream client admitted"
        );
        Ok(Admitted { client, frames })
    }

    /// Removes a client. Returns `false` if it was already gone.
    ///
    /// Once this returns, no further frame reaches the client.
    pub fn remove(&self, id: ClientId) -> bool {
        let removed = self.registry.unregister(id).is_some();
        if removed {
            tracing::info!(client = %id, clients = self.registry.len(), "stream client removed");
        }
        removed
    }

    /// Removes every client, returning how many were registered.
    pub fn remove_all(&self) -> usize {
        let drained = self.registry.drain();
        if !drained.is_empty() {
            tracing::info!(clients = drained.len(), "all stream clients removed");
        }
        drained.len()
    }

    /// Delivers one event to every matching client.
    ///
    /// The frame is serialized once and shared. A closed client is removed;
    /// a full client drops the frame and is removed once its consecutive
    /// drops exceed the configured tolerance.
    pub fn dispatch(&self, event: &Event) -> DispatchOutcome {
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        let mut outcome = DispatchOutcome::default();
        let mut encoded: Option<Frame> = None;

        for client in self.registry.snapshot() {
            if !client.filter().matches(event) {
                continue;
            }
            outcome.matched += 1;

            let frame = if let Some(frame) = &encoded {
                frame.clone()
            } else {
                match Frame::event(event) {
                    Ok(frame) => {
                        encoded = Some(frame.clone());
                        frame
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            event_type = event.event_type(),
                            "dropping unserializable event"
                        );
                        return outcome;
                    }
                }
            };

            match client.sink().try_deliver(frame) {
                Ok(()) => outcome.delivered += 1,
                Err(SendError::Closed) => {
                    if self.evict(&client, SendError::Closed) {
                        outcome.evicted += 1;
                    }
                }
                Err(SendError::Full) => {
                    outcome.dropped += 1;
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    let drops = client.sink().record_drop();
                    if drops > self.config.max_consecutive_drops
                        && self.evict(&client, SendError::Full)
                    {
                        outcome.evicted += 1;
                    }
                }
            }
        }

        self.counters
            .deliveries
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        outcome
    }

    fn evict(&self, client: &Client, reason: SendError) -> bool {
        let removed = self.registry.unregister(client.id()).is_some();
        if removed {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                client = %client.id(),
                source_ip = %client.source_ip(),
                %reason,
                pending_drops = client.sink().pending_drops(),
                "evicting stream client"
            );
        }
        removed
    }

    /// Aggregated client, subscription and upstream statistics.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        let clients = self.registry.snapshot();
        let mut stats = Statistics {
            total_clients: clients.len(),
            max_clients: self.registry.max_clients(),
            events_dispatched: self.counters.events.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            dropped_deliveries: self.counters.dropped.load(Ordering::Relaxed),
            evicted_clients: self.counters.evicted.load(Ordering::Relaxed),
            ..Statistics::default()
        };
        for client in &clients {
            let filter = client.filter();
            if filter.is_empty() {
                stats.unfiltered_clients += 1;
            }
            for domain in filter.domains() {
                *stats
                    .per_domain_subscription_counts
                    .entry(domain.to_string())
                    .or_default() += 1;
            }
            for event_type in filter.event_types() {
                *stats
                    .per_event_type_subscription_counts
                    .entry(event_type.to_string())
                    .or_default() += 1;
            }
            for entity_id in filter.entity_ids() {
                *stats
                    .per_entity_subscription_counts
                    .entry(entity_id.to_string())
                    .or_default() += 1;
            }
            stats.clients.push(ClientStatistics::from(client.as_ref()));
        }
        stats.clients.sort_by_key(|c| c.connected_at);

        let upstream = self.upstream.borrow().clone();
        stats.uptime_of_upstream_secs = upstream.uptime().map(|d| d.as_secs());
        stats.upstream = upstream;
        stats
    }
}

impl EventHandler for BroadcastHub {
    fn handle(&self, event: Event) {
        let outcome = self.dispatch(&event);
        tracing::trace!(
            event_type = event.event_type(),
            matched = outcome.matched,
            delivered = outcome.delivered,
            "event dispatched"
        );
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::net::Ipv4Addr;

    use chrono::Utc;

    use super::*;
    use crate::auth::StaticTokenGate;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn hub_with(config: HubConfig) -> BroadcastHub {
        let (_tx, rx) = watch::channel(UpstreamStatus::default());
        BroadcastHub::new(config, Arc::new(StaticTokenGate::new(["good"])), rx)
    }

    fn hub(max_clients: usize) -> BroadcastHub {
        hub_with(HubConfig {
            max_clients,
            ..HubConfig::default()
        })
    }

    fn connect(filter: Filter) -> ClientConnection {
        ClientConnection {
            source_ip: IP,
            filter,
        }
    }

    fn admit(hub: &BroadcastHub, filter: Filter) -> Admitted {
        let Ok(admitted) = hub.admit(connect(filter), "good") else {
            panic!("admission failed");
        };
        admitted
    }

    fn event(entity_id: &str) -> Event {
        Event::new(
            "state_changed",
            Some(entity_id.to_string()),
            serde_json::json!({"entity_id": entity_id}),
            Utc::now(),
        )
    }

    fn domain_filter(domain: &str) -> Filter {
        let mut filter = Filter::new();
        filter.add_domain(domain);
        filter
    }

    #[test]
    fn unauthorized_admission_leaves_registry_untouched() {
        let hub = hub(10);
        let result = hub.admit(connect(Filter::new()), "bad");
        assert!(matches!(result, Err(AdmissionError::Unauthorized(_))));
        assert!(hub.registry().is_empty());
    }

    #[test]
    fn admission_beyond_capacity_is_rejected() {
        let hub = hub(100);
        let admitted: Vec<_> = (0..100).map(|_| admit(&hub, Filter::new())).collect();
        assert_eq!(admitted.len(), 100);

        let result = hub.admit(connect(Filter::new()), "good");
        assert!(matches!(
            result,
            Err(AdmissionError::CapacityExceeded { max: 100 })
        ));
        assert_eq!(hub.registry().len(), 100);
    }

    #[test]
    fn domain_subscriber_only_receives_its_domain() {
        let hub = hub(10);
        let mut lights = admit(&hub, domain_filter("light"));

        assert_eq!(hub.dispatch(&event("light.living_room")).delivered, 1);
        assert_eq!(hub.dispatch(&event("switch.fan")).delivered, 0);

        let Ok(frame) = lights.frames.try_recv() else {
            panic!("light event not delivered");
        };
        assert!(frame.as_str().contains("light.living_room"));
        assert!(lights.frames.try_recv().is_err());
    }

    #[test]
    fn unfiltered_subscriber_receives_everything() {
        let hub = hub(10);
        let mut all = admit(&hub, Filter::new());
        let _ = hub.dispatch(&event("light.a"));
        let _ = hub.dispatch(&event("switch.b"));
        let _ = hub.dispatch(&Event::new(
            "call_service",
            None,
            serde_json::Value::Null,
            Utc::now(),
        ));
        let mut received = 0;
        while all.frames.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[test]
    fn broken_client_is_removed_without_affecting_others() {
        let hub = hub(10);
        let mut first = admit(&hub, Filter::new());
        let second = admit(&hub, Filter::new());
        let mut third = admit(&hub, Filter::new());
        let broken_id = second.client.id();
        drop(second.frames);

        let outcome = hub.dispatch(&event("light.kitchen"));
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.evicted, 1);
        assert!(first.frames.try_recv().is_ok());
        assert!(third.frames.try_recv().is_ok());
        assert!(hub.registry().get(broken_id).is_none());
        assert_eq!(hub.registry().len(), 2);
    }

    #[test]
    fn full_buffer_evicts_after_tolerance() {
        let hub = hub_with(HubConfig {
            max_clients: 10,
            client_buffer_capacity: 1,
            max_consecutive_drops: 1,
        });
        let slow = admit(&hub, Filter::new());
        let mut fast = admit(&hub, Filter::new());

        let _ = hub.dispatch(&event("light.a"));
        let _ = fast.frames.try_recv();
        let second = hub.dispatch(&event("light.b"));
        assert_eq!(second.dropped, 1);
        assert_eq!(second.evicted, 0);
        assert_eq!(slow.client.sink().pending_drops(), 1);

        let _ = fast.frames.try_recv();
        let third = hub.dispatch(&event("light.c"));
        assert_eq!(third.evicted, 1);
        assert!(hub.registry().get(slow.client.id()).is_none());
        assert!(fast.frames.try_recv().is_ok());
    }

    #[test]
    fn per_client_order_matches_dispatch_order() {
        let hub = hub(10);
        let mut client = admit(&hub, Filter::new());
        for n in 0..5 {
            let _ = hub.dispatch(&event(&format!("sensor.s{n}")));
        }
        for n in 0..5 {
            let Ok(frame) = client.frames.try_recv() else {
                panic!("missing frame {n}");
            };
            assert!(frame.as_str().contains(&format!("sensor.s{n}")));
        }
    }

    #[test]
    fn unregister_clears_subscription_statistics() {
        let hub = hub(10);
        let admitted = admit(&hub, Filter::new());
        let id = admitted.client.id();
        assert_eq!(hub.registry().add_domain_filter(id, "climate"), Ok(()));
        assert_eq!(
            hub.statistics().per_domain_subscription_counts.get("climate"),
            Some(&1)
        );

        assert!(hub.remove(id));
        let stats = hub.statistics();
        assert_eq!(stats.total_clients, 0);
        assert_eq!(stats.per_domain_subscription_counts.get("climate"), None);
    }

    #[test]
    fn remove_twice_is_a_no_op() {
        let hub = hub(10);
        let admitted = admit(&hub, Filter::new());
        let _other = admit(&hub, Filter::new());
        let id = admitted.client.id();

        assert!(hub.remove(id));
        assert!(!hub.remove(id));
        assert_eq!(hub.statistics().total_clients, 1);
    }

    #[test]
    fn no_delivery_after_removal() {
        let hub = hub(10);
        let mut admitted = admit(&hub, Filter::new());
        assert!(hub.remove(admitted.client.id()));
        assert_eq!(hub.dispatch(&event("light.a")).matched, 0);
        assert!(admitted.frames.try_recv().is_err());
    }

    #[test]
    fn statistics_counts_subscriptions() {
        let hub = hub(10);
        let _a = admit(&hub, domain_filter("light"));
        let _b = admit(&hub, domain_filter("light"));
        let mut by_type = Filter::new();
        by_type.add_event_type("automation_triggered");
        let _c = admit(&hub, by_type);
        let _d = admit(&hub, Filter::new());
        let _ = hub.dispatch(&event("light.porch"));

        let stats = hub.statistics();
        assert_eq!(stats.total_clients, 4);
        assert_eq!(stats.unfiltered_clients, 1);
        assert_eq!(stats.per_domain_subscription_counts.get("light"), Some(&2));
        assert_eq!(
            stats
                .per_event_type_subscription_counts
                .get("automation_triggered"),
            Some(&1)
        );
        assert_eq!(stats.events_dispatched, 1);
        assert_eq!(stats.deliveries, 3);
        assert_eq!(stats.clients.len(), 4);
        assert!(stats.uptime_of_upstream_secs.is_none());
    }
}
