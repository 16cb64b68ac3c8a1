//! Server-Sent Events (SSE) handler.
//!
//! Subscribes to the [`mq_core::events::EventBus`], optionally filters to a
//! single session, replays recent events for late joiners, and sends
//! keepalive heartbeats.

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use mq_core::events::EventPayload;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;

use crate::context::AppContext;

/// Events replayed to a new subscriber before live ones.
const REPLAY_EVENTS: usize = 50;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Only forward events for this session id.
    pub session: Option<String>,
}

/// GET /api/events -- SSE stream of session lifecycle events.
pub async fn events_handler(
    State(ctx): State<AppContext>,
    Query(params): Query<EventsQuery>,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>> {
    let session_filter = params.session;

    let recent = ctx.event_bus.recent_events(REPLAY_EVENTS);
    let mut rx = ctx.event_bus.subscribe();

    let stream = async_stream::stream! {
        for event in recent.into_iter().rev() {
            if matches_session(&event.payload, &session_filter) {
                if let Ok(data) = serde_json::to_string(&event) {
                    yield Ok(Event::default().data(data));
                }
            }
        }

        let mut heartbeat = tokio::time::interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if matches_session(&event.payload, &session_filter) {
                                if let Ok(data) = serde_json::to_string(&event) {
                                    yield Ok(Event::default().data(data));
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!("SSE client lagged by {n} events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default()
                        .event("heartbeat")
                        .data(r#"{"type":"heartbeat"}"#));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn matches_session(payload: &EventPayload, filter: &Option<String>) -> bool {
    match filter {
        Some(id) => payload.session_id().to_string() == *id,
        None => true,
    }
}
