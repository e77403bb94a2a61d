//! Server events, envelope schema, and the broadcast event bus.
//!
//! Notifications posted on the [`NotificationBus`](crate::notifications::NotificationBus)
//! are relayed here by the server's monitor tasks. Downstream consumers (the
//! SSE stream, tests) subscribe independently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::QueryState;

// ============================================================================
// Event Envelope
// ============================================================================

/// Versioned wrapper around a [`ServerEvent`].
///
/// ## Wire Format (SSE)
///
/// ```text
/// event: query.state_changed
/// id: 019508a0-1234-7def-8000-abcdef123456
/// data: {"event_id":"...","event_type":"query.state_changed","occurred_at":"...","payload":{...}}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event type (e.g., `"query.state_changed"`).
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    /// Query the event relates to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    pub payload_version: u32,
    pub payload: ServerEvent,
}

impl EventEnvelope {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event_id: crate::uuid_utils::new_v7(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            query_id: event.query_id().map(String::from),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Server Event (domain payloads)
// ============================================================================

/// Notification payloads as seen by external clients.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"QueryStateChanged","id":"...","state":"QS_TRAINED"}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A query moved to a new lifecycle state.
    QueryStateChanged { id: String, state: QueryState },
    /// One training image was post-processed.
    ImageProcessed { id: String, fname: String },
    /// All training images of an ingestion request were post-processed.
    AllImagesProcessed { id: String },
    /// A background train/rank for a query failed.
    QueryError { id: String, err_msg: String },
    /// The dataset index was (or failed to be) extended.
    IndexUpdated {
        images_added: usize,
        success: bool,
        #[serde(skip_serializing_if = "String::is_empty")]
        err_msg: String,
    },
}

impl ServerEvent {
    /// Namespaced event type for the envelope and the SSE `event:` field.
    pub fn namespaced_event_type(&self) -> &'static str {
        match self {
            ServerEvent::QueryStateChanged { .. } => "query.state_changed",
            ServerEvent::ImageProcessed { .. } => "query.image_processed",
            ServerEvent::AllImagesProcessed { .. } => "query.all_images_processed",
            ServerEvent::QueryError { .. } => "query.error",
            ServerEvent::IndexUpdated { .. } => "index.updated",
        }
    }

    pub fn query_id(&self) -> Option<&str> {
        match self {
            ServerEvent::QueryStateChanged { id, .. }
            | ServerEvent::ImageProcessed { id, .. }
            | ServerEvent::AllImagesProcessed { id }
            | ServerEvent::QueryError { id, .. } => Some(id),
            ServerEvent::IndexUpdated { .. } => None,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus for distributing server events.
///
/// Slow receivers that fall behind get a `Lagged` error and miss events.
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently without subscribers.
    pub fn emit(&self, event: ServerEvent) {
        let envelope = EventEnvelope::new(event);
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count,
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
