//! Process-wide wiring of the upstream source, hub and lifecycle manager.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::broadcast_hub::BroadcastHub;
use super::lifecycle::ClientLifecycleManager;
use crate::auth::AuthGate;
use crate::config::GatewayConfig;
use crate::upstream::{
    EventHandler, UpstreamConnectionState, UpstreamEventSource, UpstreamStatus,
};

/// Owns the running core. Build one per process with [`Gateway::init`].
#[derive(Debug)]
pub struct Gateway {
    upstream: UpstreamEventSource,
    lifecycle: ClientLifecycleManager,
    monitor: JoinHandle<()>,
}

impl Gateway {
    /// Builds the core and starts the upstream connection.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn init(config: &GatewayConfig, auth: Arc<dyn AuthGate>) -> Self {
        let upstream = UpstreamEventSource::new(config.upstream.clone());
        let hub = Arc::new(BroadcastHub::new(
            config.hub.clone(),
            auth,
            upstream.status(),
        ));
        let handler: Arc<dyn EventHandler> = Arc::clone(&hub) as Arc<dyn EventHandler>;
        upstream.on_event(handler);
        let monitor = spawn_upstream_monitor(upstream.status());
        upstream.start();

        Self {
            upstream,
            lifecycle: ClientLifecycleManager::new(hub),
            monitor,
        }
    }

    /// Manager used by the stream routes.
    #[must_use]
    pub const fn lifecycle(&self) -> &ClientLifecycleManager {
        &self.lifecycle
    }

    /// The upstream source.
    #[must_use]
    pub const fn upstream(&self) -> &UpstreamEventSource {
        &self.upstream
    }

    /// Stops the upstream connection and removes every client.
    pub async fn shutdown(&self) {
        self.upstream.stop().await;
        let removed = self.lifecycle.shutdown();
        self.monitor.abort();
        tracing::info!(clients = removed, "gateway shut down");
    }
}

/// Logs every upstream state transition; `Failed` is logged at error level.
fn spawn_upstream_monitor(mut status: watch::Receiver<UpstreamStatus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = status.borrow_and_update().state;
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if current.state == last {
                continue;
            }
            last = current.state;
            match current.state {
                UpstreamConnectionState::Failed => tracing::error!(
                    attempts = current.reconnect_attempt,
                    error = current.last_error.as_deref().unwrap_or("unknown"),
                    "upstream connection failed; restart required"
                ),
                UpstreamConnectionState::Reconnecting => tracing::warn!(
                    attempt = current.reconnect_attempt,
                    error = current.last_error.as_deref().unwrap_or("unknown"),
                    "upstream connection lost"
                ),
                state => tracing::info!(%state, "upstream state changed"),
            }
        }
    })
}
