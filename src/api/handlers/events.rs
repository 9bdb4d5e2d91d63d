//! Event stream handlers: SSE subscription and hub statistics.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, header};
use axum::middleware;
use axum::response::IntoResponse;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};

use crate::api::dto::StreamQuery;
use crate::app_state::AppState;
use crate::error::AdmissionError;
use crate::rate_limit::throttle;
use crate::service::{ClientConnection, Statistics};

/// `GET /events/stream`: Open a filtered SSE event stream.
///
/// The first frame is the connection handshake; every following frame is
/// one upstream event passing the requested filter.
///
/// # Errors
///
/// Returns [`AdmissionError`] (401 or 503, with one SSE error frame) when
/// the client is not admitted.
#[utoipa::path(
    get,
    path = "/api/v1/events/stream",
    tag = "Events",
    summary = "Subscribe to hub events",
    description = "Opens a Server-Sent Events stream. `events`, `entity_id` and `domain` take comma-separated lists; a client matching none of them receives every event.",
    params(StreamQuery),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = String),
        (status = 401, description = "Missing or invalid token", content_type = "text/event-stream", body = String),
        (status = 429, description = "Too many stream requests", body = crate::error::ErrorResponse),
        (status = 503, description = "Client capacity reached", content_type = "text/event-stream", body = String),
    )
)]
pub async fn stream_events(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AdmissionError> {
    let token = query
        .token
        .clone()
        .or_else(|| bearer_token(&headers))
        .unwrap_or_default();
    let connection = ClientConnection {
        source_ip: addr.ip(),
        filter: query.filter(),
    };
    let session = state.gateway.lifecycle().add(connection, &token)?;

    let stream = session
        .into_stream()
        .map(|frame| Ok(SseEvent::default().data(frame.as_str())));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.sse_keepalive)))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

/// `GET /events/stats`: Client, subscription and upstream statistics.
#[utoipa::path(
    get,
    path = "/api/v1/events/stats",
    tag = "Events",
    summary = "Stream statistics",
    description = "Returns registered clients, per-key subscription counts, delivery counters and the upstream connection status.",
    responses(
        (status = 200, description = "Current statistics", body = Statistics),
    )
)]
pub async fn event_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.lifecycle().statistics())
}

/// Event routes, nested under `/api/v1`. The stream route is throttled
/// per source IP.
pub fn routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/events/stream",
            get(stream_events).route_layer(middleware::from_fn_with_state(
                state.rate_limiter.clone(),
                throttle,
            )),
        )
        .route("/events/stats", get(event_stats))
}
