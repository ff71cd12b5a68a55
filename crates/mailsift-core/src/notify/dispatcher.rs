//! Detached notification delivery with bounded backlog and concurrency

use super::Notifier;
use mailsift_common::config::NotificationConfig;
use mailsift_common::types::NotificationEvent;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Cheap handle used by workers to hand events over
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<NotificationEvent>,
}

impl DispatchHandle {
    /// Queue an event without waiting; returns false when it was dropped
    pub fn dispatch(&self, event: NotificationEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Notification backlog full, dropping event for message {}",
                    event.message_id
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(
                    "Notification dispatcher stopped, dropping event for message {}",
                    event.message_id
                );
                false
            }
        }
    }
}

/// Runs deliveries on tracked tasks, at most `max_in_flight` at once
pub struct NotificationDispatcher {
    handle: DispatchHandle,
    runner: JoinHandle<()>,
}

impl NotificationDispatcher {
    /// Start the dispatcher
    pub fn start(notifiers: Vec<Arc<dyn Notifier>>, config: &NotificationConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.backlog.max(1));
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let notifiers: Arc<[Arc<dyn Notifier>]> = notifiers.into();

        info!(
            notifiers = notifiers.len(),
            max_in_flight = config.max_in_flight,
            "Notification dispatcher started"
        );

        let runner = tokio::spawn(run(rx, notifiers, permits));

        Self {
            handle: DispatchHandle { tx },
            runner,
        }
    }

    /// Handle for submitting events
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Stop accepting events once every handle is gone and wait for
    /// in-flight deliveries
    pub async fn shutdown(self) {
        drop(self.handle);
        if let Err(e) = self.runner.await {
            warn!("Notification dispatcher task failed: {}", e);
        }
        info!("Notification dispatcher stopped");
    }
}

async fn run(
    mut rx: mpsc::Receiver<NotificationEvent>,
    notifiers: Arc<[Arc<dyn Notifier>]>,
    permits: Arc<Semaphore>,
) {
    let tracker = TaskTracker::new();

    while let Some(event) = rx.recv().await {
        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let notifiers = Arc::clone(&notifiers);

        tracker.spawn(async move {
            deliver(&notifiers, &event).await;
            drop(permit);
        });
    }

    tracker.close();
    tracker.wait().await;
}

async fn deliver(notifiers: &[Arc<dyn Notifier>], event: &NotificationEvent) {
    for notifier in notifiers {
        match notifier.notify(event).await {
            Ok(()) => debug!(
                "Delivered {} notification for message {}",
                notifier.name(),
                event.message_id
            ),
            Err(e) => warn!(
                "{} notification for message {} failed: {}",
                notifier.name(),
                event.message_id,
                e
            ),
        }
    }
}
