//! Read-only views of hub state served by the stats endpoint.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{Client, ClientId, Filter};
use crate::upstream::UpstreamStatus;

/// Per-client view.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatistics {
    /// Client id.
    #[schema(value_type = String, format = Uuid)]
    pub id: ClientId,
    /// Remote address.
    #[schema(value_type = String)]
    pub source_ip: IpAddr,
    /// Admission time.
    pub connected_at: DateTime<Utc>,
    /// Whether the client passed the auth gate.
    pub authenticated: bool,
    /// Last successful enqueue.
    pub last_delivery_at: Option<DateTime<Utc>>,
    /// Frames enqueued so far.
    pub delivered: u64,
    /// Consecutive dropped frames.
    pub pending_drops: u32,
    /// Active filter criteria.
    #[schema(value_type = Object)]
    pub subscriptions: Filter,
}

impl From<&Client> for ClientStatistics {
    fn from(client: &Client) -> Self {
        let sink = client.sink();
        Self {
            id: client.id(),
            source_ip: client.source_ip(),
            connected_at: client.connected_at(),
            authenticated: client.authenticated(),
            last_delivery_at: sink.last_delivery_at(),
            delivered: sink.delivered(),
            pending_drops: sink.pending_drops(),
            subscriptions: client.filter().clone(),
        }
    }
}

/// Aggregated hub statistics.
///
/// Subscription counts only include registered clients, so removing the
/// last subscriber of a key removes the key.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    /// Registered clients.
    pub total_clients: usize,
    /// Admission limit.
    pub max_clients: usize,
    /// Clients with an empty filter.
    pub unfiltered_clients: usize,
    /// Clients subscribed per domain.
    pub per_domain_subscription_counts: BTreeMap<String, usize>,
    /// Clients subscribed per event type.
    pub per_event_type_subscription_counts: BTreeMap<String, usize>,
    /// Clients subscribed per entity id.
    pub per_entity_subscription_counts: BTreeMap<String, usize>,
    /// Seconds the upstream has been subscribed, if it is.
    pub uptime_of_upstream_secs: Option<u64>,
    /// Upstream connection status.
    pub upstream: UpstreamStatus,
    /// Events received from upstream.
    pub events_dispatched: u64,
    /// Frames enqueued across all clients.
    pub deliveries: u64,
    /// Frames dropped on full queues.
    pub dropped_deliveries: u64,
    /// Clients removed by the dispatch pass.
    pub evicted_clients: u64,
    /// Registered clients, oldest first.
    pub clients: Vec<ClientStatistics>,
}
