//! Out-of-band notifications for query progress.
//!
//! Each notification kind travels on its own [`SingleSubscriberQueue`]:
//! any number of producers may push, but only one consumer may wait on a
//! queue at a time. The API layer runs one monitor task per queue and
//! relays everything into the broadcast [`EventBus`](crate::events::EventBus).

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::models::QueryState;

// ─── Payloads ──────────────────────────────────────────────────────────────

/// A query moved to a new state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub id: String,
    pub state: QueryState,
}

/// One training image finished post-processing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageProcessed {
    pub id: String,
    pub fname: String,
}

/// Every image of an ingestion request has been post-processed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllImagesProcessed {
    pub id: String,
}

/// A background operation for a query failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryError {
    pub id: String,
    pub err_msg: String,
}

/// Outcome of an incremental dataset index update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexUpdated {
    pub images_added: usize,
    pub success: bool,
    pub err_msg: String,
}

// ─── Queue ─────────────────────────────────────────────────────────────────

/// Unbounded multi-producer queue with at most one waiting consumer.
pub struct SingleSubscriberQueue<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T: Send> SingleSubscriberQueue<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Push an item. Never blocks; safe to call from blocking threads.
    pub fn push(&self, item: T) {
        // The receiver lives as long as the queue, so send cannot fail.
        let _ = self.tx.send(item);
    }

    /// Wait until an item is available and take it.
    ///
    /// Fails with [`Error::AlreadySubscribed`] if another consumer is
    /// already waiting on this queue.
    pub async fn wait_and_pop(&self) -> Result<T> {
        let mut rx = self.rx.try_lock().map_err(|_| {
            Error::AlreadySubscribed(format!("{} queue already has a subscriber", self.name))
        })?;
        rx.recv()
            .await
            .ok_or_else(|| Error::Internal(format!("{} queue closed", self.name)))
    }

    /// Take an item if one is immediately available.
    pub fn try_pop(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ─── Bus ───────────────────────────────────────────────────────────────────

/// The five notification queues of the server.
pub struct NotificationBus {
    pub state_change: SingleSubscriberQueue<StateChange>,
    pub image_processed: SingleSubscriberQueue<ImageProcessed>,
    pub all_images_processed: SingleSubscriberQueue<AllImagesProcessed>,
    pub error: SingleSubscriberQueue<QueryError>,
    pub index_updated: SingleSubscriberQueue<IndexUpdated>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            state_change: SingleSubscriberQueue::new("state_change"),
            image_processed: SingleSubscriberQueue::new("image_processed"),
            all_images_processed: SingleSubscriberQueue::new("all_images_processed"),
            error: SingleSubscriberQueue::new("error"),
            index_updated: SingleSubscriberQueue::new("index_updated"),
        }
    }

    pub fn post_state_change(&self, id: &str, state: QueryState) {
        tracing::debug!(query_id = %id, state = %state, "Posting state change");
        self.state_change.push(StateChange {
            id: id.to_string(),
            state,
        });
    }

    pub fn post_image_processed(&self, id: &str, fname: &str) {
        self.image_processed.push(ImageProcessed {
            id: id.to_string(),
            fname: fname.to_string(),
        });
    }

    pub fn post_all_images_processed(&self, id: &str) {
        self.all_images_processed.push(AllImagesProcessed { id: id.to_string() });
    }

    pub fn post_error(&self, id: &str, err_msg: &str) {
        self.error.push(QueryError {
            id: id.to_string(),
            err_msg: err_msg.to_string(),
        });
    }

    pub fn post_index_updated(&self, images_added: usize, success: bool, err_msg: &str) {
        self.index_updated.push(IndexUpdated {
            images_added,
            success,
            err_msg: err_msg.to_string(),
        });
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
