//! HTTP layer: route handlers, DTOs, router composition and OpenAPI doc.
//!
//! Resource endpoints are mounted under `/api/v1`; `/health` sits at the
//! root.

pub mod dto;
pub mod handlers;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;

/// OpenAPI description of every endpoint.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "hub-event-gateway",
        description = "Filtered Server-Sent Events fan-out of a home automation hub's event bus."
    ),
    paths(
        handlers::events::stream_events,
        handlers::events::event_stats,
        handlers::system::health_handler,
    ),
    tags(
        (name = "Events", description = "Event stream subscription and statistics"),
        (name = "System", description = "Service health"),
    )
)]
pub struct ApiDoc;

/// Builds the API router with all endpoints.
pub fn build_router(state: &AppState) -> Router<AppState> {
    let router = Router::new()
        .nest("/api/v1", handlers::routes(state))
        .merge(handlers::system::routes());

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url("/api-docs/openapi.json", ApiDoc::openapi()),
    );

    router
}

/// Builds the complete application with tracing and CORS layers applied.
pub fn build_app(state: AppState) -> Router {
    build_router(&state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
