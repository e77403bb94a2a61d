//! Relay tasks from the notification queues to the event bus.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use visor_core::{EventBus, NotificationBus, Result, ServerEvent};

/// Spawn one relay task per notification queue.
///
/// Each task is the single subscriber of its queue and runs until the
/// queue fails (e.g. another subscriber already holds it).
pub fn spawn_monitors(notifications: Arc<NotificationBus>, events: Arc<EventBus>) -> Vec<JoinHandle<()>> {
    vec![
        relay("state_change", notifications.clone(), events.clone(), |n| async move {
            n.state_change
                .wait_and_pop()
                .await
                .map(|s| ServerEvent::QueryStateChanged { id: s.id, state: s.state })
        }),
        relay("image_processed", notifications.clone(), events.clone(), |n| async move {
            n.image_processed
                .wait_and_pop()
                .await
                .map(|p| ServerEvent::ImageProcessed { id: p.id, fname: p.fname })
        }),
        relay("all_images_processed", notifications.clone(), events.clone(), |n| async move {
            n.all_images_processed
                .wait_and_pop()
                .await
                .map(|p| ServerEvent::AllImagesProcessed { id: p.id })
        }),
        relay("error", notifications.clone(), events.clone(), |n| async move {
            n.error
                .wait_and_pop()
                .await
                .map(|e| ServerEvent::QueryError { id: e.id, err_msg: e.err_msg })
        }),
        relay("index_updated", notifications, events, |n| async move {
            n.index_updated.wait_and_pop().await.map(|u| ServerEvent::IndexUpdated {
                images_added: u.images_added,
                success: u.success,
                err_msg: u.err_msg,
            })
        }),
    ]
}

fn relay<F, Fut>(
    queue: &'static str,
    notifications: Arc<NotificationBus>,
    events: Arc<EventBus>,
    next: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<NotificationBus>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<ServerEvent>> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(component = "monitor", queue, "Notification monitor started");
        loop {
            match next(notifications.clone()).await {
                Ok(event) => events.emit(event),
                Err(e) => {
                    error!(component = "monitor", queue, error = %e, "Notification monitor stopped");
                    break;
                }
            }
        }
    })
}
