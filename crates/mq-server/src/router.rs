//! Axum router construction.
//!
//! Builds the application router with the transcode routes, diagnostics,
//! and middleware layers.

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::middleware::request_id::request_id_middleware;
use crate::routes;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let transcode_routes = Router::new()
        .route("/sessions", get(routes::transcode::list_sessions))
        .route(
            "/{content}/master.m3u8",
            get(routes::transcode::master_playlist),
        )
        .route(
            "/{content}/{quality}",
            delete(routes::transcode::stop_session),
        )
        .route(
            "/{content}/{quality}/index.m3u8",
            get(routes::transcode::media_playlist),
        )
        .route(
            "/{content}/{quality}/segment/{file}",
            get(routes::transcode::segment),
        )
        .route("/{content}/{quality}/seek", post(routes::transcode::seek));

    let api = Router::new()
        .nest("/transcode", transcode_routes)
        .route("/qualities", get(routes::transcode::list_qualities))
        .route("/tools", get(routes::admin::tools))
        .route("/events", get(routes::events::events_handler))
        .route("/events/recent", get(routes::admin::recent_events));

    Router::new()
        .route("/health", get(routes::admin::health_check))
        .nest("/api", api)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
