//! hub-event-gateway server entry point.
//!
//! Connects to the hub and starts the Axum HTTP server with the SSE
//! stream, stats and health endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use hub_event_gateway::api;
use hub_event_gateway::app_state::AppState;
use hub_event_gateway::auth::StaticTokenGate;
use hub_event_gateway::config::GatewayConfig;
use hub_event_gateway::rate_limit::RateLimiter;
use hub_event_gateway::service::Gateway;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = GatewayConfig::from_env()?;
    tracing::info!(
        addr = %config.listen_addr,
        hub = %config.upstream.url,
        max_clients = config.hub.max_clients,
        "starting hub-event-gateway"
    );

    let auth = StaticTokenGate::new(config.access_tokens.iter().cloned());
    if auth.is_empty() {
        tracing::warn!("ACCESS_TOKENS is empty; every stream request will be rejected");
    }

    // Build core
    let gateway = Arc::new(Gateway::init(&config, Arc::new(auth)));

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);
    let cleanup = rate_limiter.spawn_cleanup_task(Duration::from_secs(60));

    // Build application state
    let app_state = AppState {
        gateway: Arc::clone(&gateway),
        rate_limiter,
        sse_keepalive: config.sse_keepalive,
    };
    let app = api::build_app(app_state);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    let shutdown_gateway = Arc::clone(&gateway);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown signal received");
        // Ends open SSE streams so graceful shutdown can complete.
        shutdown_gateway.shutdown().await;
    })
    .await?;

    cleanup.abort();
    gateway.shutdown().await;
    Ok(())
}
