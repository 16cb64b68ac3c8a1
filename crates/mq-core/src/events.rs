//! Session lifecycle events.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so diagnostics endpoints can show what
//! happened without holding a subscription open.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EncoderFailure;
use crate::ids::{SessionId, SessionKey};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Idle,
    Stopped,
    Failed,
    Shutdown,
}

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionCreated {
        session_id: SessionId,
        key: SessionKey,
        duration_secs: f64,
        segments: u64,
    },
    GenerationStarted {
        session_id: SessionId,
        generation: u32,
        offset_secs: f64,
        start_index: u64,
        pid: Option<u32>,
    },
    SeekReused {
        session_id: SessionId,
        offset_secs: f64,
        index: u64,
    },
    EncoderCrashed {
        session_id: SessionId,
        generation: u32,
        failure: EncoderFailure,
        restarting: bool,
    },
    SessionTerminated {
        session_id: SessionId,
        key: SessionKey,
        reason: TerminationReason,
    },
}

impl EventPayload {
    pub fn session_id(&self) -> SessionId {
        match self {
            EventPayload::SessionCreated { session_id, .. }
            | EventPayload::GenerationStarted { session_id, .. }
            | EventPayload::SeekReused { session_id, .. }
            | EventPayload::EncoderCrashed { session_id, .. }
            | EventPayload::SessionTerminated { session_id, .. } => *session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// `capacity` sizes the broadcast channel, not the ring buffer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Store the event in the ring buffer and send it to live subscribers.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event::new(payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.recent.read().iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::parse("movie", "720p").unwrap()
    }

    #[test]
    fn broadcast_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let session_id = SessionId::new();
        bus.broadcast(EventPayload::SeekReused {
            session_id,
            offset_secs: 30.0,
            index: 5,
        });

        let event = rx.try_recv().unwrap();
        match event.payload {
            EventPayload::SeekReused { session_id: got, index, .. } => {
                assert_eq!(got, session_id);
                assert_eq!(index, 5);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn recent_events_capped() {
        let bus = EventBus::new(256);
        for _ in 0..150 {
            bus.broadcast(EventPayload::SessionTerminated {
                session_id: SessionId::new(),
                key: key(),
                reason: TerminationReason::Idle,
            });
        }
        assert_eq!(bus.recent_events(200).len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn recent_events_newest_first() {
        let bus = EventBus::default();
        let first = SessionId::new();
        let last = SessionId::new();
        bus.broadcast(EventPayload::SessionCreated {
            session_id: first,
            key: key(),
            duration_secs: 300.0,
            segments: 50,
        });
        bus.broadcast(EventPayload::SessionTerminated {
            session_id: last,
            key: key(),
            reason: TerminationReason::Stopped,
        });

        let recent = bus.recent_events(1);
        assert_eq!(recent.len(), 1);
        assert!(matches!(
            recent[0].payload,
            EventPayload::SessionTerminated { session_id, .. } if session_id == last
        ));
    }

    #[test]
    fn payload_tags_are_snake_case() {
        let json = serde_json::to_value(EventPayload::EncoderCrashed {
            session_id: SessionId::new(),
            generation: 2,
            failure: EncoderFailure::DiskFull,
            restarting: true,
        })
        .unwrap();
        assert_eq!(json["type"], "encoder_crashed");
        assert_eq!(json["failure"]["kind"], "disk_full");
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.broadcast(EventPayload::SeekReused {
            session_id: SessionId::new(),
            offset_secs: 0.0,
            index: 0,
        });
        assert_eq!(bus.recent_events(10).len(), 1);
    }
}
