//! Health, tool and diagnostics route handlers.

use axum::extract::{Query, State};
use axum::Json;
use mq_core::events::Event;
use serde::{Deserialize, Serialize};

use crate::context::AppContext;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}

/// GET /health
pub async fn health_check(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: ctx.registry.len(),
    })
}

/// GET /api/tools
pub async fn tools(State(ctx): State<AppContext>) -> Json<Vec<mq_av::ToolInfo>> {
    Json(ctx.tools.check_all())
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

/// GET /api/events/recent -- newest first.
pub async fn recent_events(
    State(ctx): State<AppContext>,
    Query(params): Query<RecentQuery>,
) -> Json<Vec<Event>> {
    Json(ctx.event_bus.recent_events(params.limit.unwrap_or(20)))
}
