//! Background job enqueueing for legacy workers
//!
//! Jobs use the Sidekiq wire format: the queue name is registered in the
//! `queues` set and the JSON job is pushed onto `queue:<name>`.

use super::Notifier;
use crate::cache::{Cache, KeySpace};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use mailsift_common::types::{MailboxId, MessageId, NotificationEvent};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Job payload
#[derive(Debug, Clone, Serialize)]
pub struct Job<'a> {
    pub retry: bool,
    pub queue: &'a str,
    pub class: &'a str,
    pub args: [i64; 2],
    pub jid: String,
    pub enqueued_at: f64,
}

impl<'a> Job<'a> {
    pub fn new(queue: &'a str, class: &'a str, mailbox_id: MailboxId, message_id: MessageId) -> Self {
        Self {
            retry: true,
            queue,
            class,
            args: [mailbox_id, message_id],
            jid: new_jid(),
            enqueued_at: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Random 24 hex character job id
fn new_jid() -> String {
    hex::encode(&Uuid::new_v4().as_bytes()[..12])
}

/// Enqueues one job per event
pub struct JobQueueNotifier {
    cache: Arc<dyn Cache>,
    keys: KeySpace,
    queue: String,
    class: String,
}

impl JobQueueNotifier {
    pub fn new(
        cache: Arc<dyn Cache>,
        keys: KeySpace,
        queue: impl Into<String>,
        class: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            keys,
            queue: queue.into(),
            class: class.into(),
        }
    }
}

#[async_trait]
impl Notifier for JobQueueNotifier {
    fn name(&self) -> &'static str {
        "jobqueue"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        let job = Job::new(&self.queue, &self.class, event.mailbox_id, event.message_id);
        let body = serde_json::to_string(&job)?;

        self.cache
            .set_add_and_push(
                &self.keys.job_queues(),
                &self.queue,
                &self.keys.job_queue(&self.queue),
                &body,
            )
            .await?;

        debug!("Enqueued job {} on queue {}", job.jid, self.queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use mailsift_common::types::Credentials;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_jid_format() {
        let jid = new_jid();
        assert_eq!(jid.len(), 24);
        assert!(jid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(jid, new_jid());
    }

    #[tokio::test]
    async fn test_enqueue() {
        let cache = MemoryCache::new();
        let notifier = JobQueueNotifier::new(
            Arc::new(cache.clone()),
            KeySpace::new("resque"),
            "mail",
            "NewMessageWorker",
        );
        let event = NotificationEvent {
            mailbox_id: 4,
            message_id: 19,
            credentials: Credentials::default(),
        };

        notifier.notify(&event).await.unwrap();
        notifier.notify(&event).await.unwrap();

        assert_eq!(cache.members("resque:queues").await, vec!["mail"]);
        let jobs = cache.list("resque:queue:mail").await;
        assert_eq!(jobs.len(), 2);

        let job: serde_json::Value = serde_json::from_str(&jobs[0]).unwrap();
        assert_eq!(job["retry"], true);
        assert_eq!(job["queue"], "mail");
        assert_eq!(job["class"], "NewMessageWorker");
        assert_eq!(job["args"], serde_json::json!([4, 19]));
        assert_eq!(job["jid"].as_str().map(str::len), Some(24));
        assert!(job["enqueued_at"].as_f64().unwrap() > 1_600_000_000.0);
    }
}
