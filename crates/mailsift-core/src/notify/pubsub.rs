//! Subscriber fan-out through the shared cache
//!
//! Each subscriber of `/inboxes/<id>` gets the event pushed to its own
//! message list and is woken through the notifications channel. Lists of
//! subscribers that have not been seen recently are dropped.

use super::{EventPayload, Notifier};
use crate::cache::{Cache, KeySpace};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use mailsift_common::types::NotificationEvent;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Pushes events into per-subscriber queues
pub struct PubSubNotifier {
    cache: Arc<dyn Cache>,
    keys: KeySpace,
    stale_after: Duration,
}

impl PubSubNotifier {
    pub fn new(cache: Arc<dyn Cache>, keys: KeySpace, stale_after: Duration) -> Self {
        Self {
            cache,
            keys,
            stale_after,
        }
    }

    async fn push(&self, client_id: &str, payload: &str) -> mailsift_common::Result<()> {
        self.cache
            .list_push(&self.keys.client_messages(client_id), payload)
            .await?;
        self.cache
            .publish(&self.keys.notifications_channel(), client_id)
            .await
    }

    /// Drop the subscriber's queue when its last-seen time is older than
    /// `cutoff_ms`. Subscribers without a last-seen time count as stale.
    async fn prune_if_stale(&self, client_id: &str, cutoff_ms: f64) {
        let seen = match self
            .cache
            .sorted_set_score(&self.keys.clients(), client_id)
            .await
        {
            Ok(seen) => seen,
            Err(e) => {
                warn!("Failed to read last-seen time of subscriber {}: {}", client_id, e);
                return;
            }
        };

        if seen.is_some_and(|ms| ms >= cutoff_ms) {
            return;
        }

        debug!("Dropping queue of stale subscriber {}", client_id);
        if let Err(e) = self.cache.delete(&self.keys.client_messages(client_id)).await {
            warn!("Failed to drop queue of subscriber {}: {}", client_id, e);
        }
    }
}

#[async_trait]
impl Notifier for PubSubNotifier {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        let subscribers = self
            .cache
            .set_union(&[self.keys.channel_subscribers(event.mailbox_id)])
            .await?;
        if subscribers.is_empty() {
            debug!("No subscribers for mailbox {}", event.mailbox_id);
            return Ok(());
        }

        let payload = EventPayload::from(event).to_json()?;
        let cutoff_ms = (Utc::now().timestamp_millis() as f64) - self.stale_after.as_millis() as f64;

        let mut failures = 0;
        for client_id in &subscribers {
            if let Err(e) = self.push(client_id, &payload).await {
                warn!("Failed to push event to subscriber {}: {}", client_id, e);
                failures += 1;
            }
            self.prune_if_stale(client_id, cutoff_ms).await;
        }

        if failures > 0 {
            return Err(anyhow!(
                "{} of {} subscriber pushes failed",
                failures,
                subscribers.len()
            ));
        }
        Ok(())
    }
}
