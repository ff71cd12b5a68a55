//! Shared cache contract
//!
//! Counters, subscriber bookkeeping, job queues and the inbox settings
//! cache all live in one key-value store. Production uses Redis; tests use
//! [`MemoryCache`].

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

use async_trait::async_trait;
use mailsift_common::types::MailboxId;
use mailsift_common::Result;
use std::collections::HashMap;
use std::time::Duration;

/// Operations the core needs from the cache backend
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read an integer counter; `None` when absent
    async fn get_counter(&self, key: &str) -> Result<Option<i64>>;

    /// Increment a counter, setting `ttl` only when the increment creates it
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Union of the members of several sets
    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>>;

    /// Append to the tail of a list
    async fn list_push(&self, key: &str, value: &str) -> Result<()>;

    /// Publish a message on a channel
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Score of a sorted set member; `None` when absent
    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically add `member` to `set_key` and push `value` to the head of `list_key`
    async fn set_add_and_push(
        &self,
        set_key: &str,
        member: &str,
        list_key: &str,
        value: &str,
    ) -> Result<()>;

    /// Read every field of a hash; empty when absent
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Write hash fields and (re)set the key expiry
    async fn hash_set_with_expiry(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<()>;
}

/// Key names, scoped by the configured namespace
#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn prefix(&self) -> String {
        if self.namespace.is_empty() {
            String::new()
        } else {
            format!("{}:", self.namespace)
        }
    }

    /// Short-window inbound counter
    pub fn rate_counter(&self, mailbox_id: MailboxId) -> String {
        format!("{}rate-inbox-limits-{}", self.prefix(), mailbox_id)
    }

    /// Long-window campaign counter
    pub fn campaign_counter(&self, mailbox_id: MailboxId) -> String {
        format!("{}mailbox_msg_count_{}", self.prefix(), mailbox_id)
    }

    /// Cached inbox settings hash
    pub fn inbox_settings(&self, mailbox_id: MailboxId) -> String {
        format!("{}inboxes-settings-cache_{}", self.prefix(), mailbox_id)
    }

    /// Set of subscriber ids of a mailbox channel
    pub fn channel_subscribers(&self, mailbox_id: MailboxId) -> String {
        format!("{}/channels/inboxes/{}", self.namespace, mailbox_id)
    }

    /// Pending message list of one subscriber
    pub fn client_messages(&self, client_id: &str) -> String {
        format!("{}/clients/{}/messages", self.namespace, client_id)
    }

    /// Sorted set of subscriber last-seen times
    pub fn clients(&self) -> String {
        format!("{}/clients", self.namespace)
    }

    /// Channel announcing that a subscriber has messages waiting
    pub fn notifications_channel(&self) -> String {
        format!("{}/notifications/messages", self.namespace)
    }

    /// Set of known job queue names
    pub fn job_queues(&self) -> String {
        format!("{}queues", self.prefix())
    }

    /// Job list of one queue
    pub fn job_queue(&self, queue: &str) -> String {
        format!("{}queue:{}", self.prefix(), queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_keys() {
        let keys = KeySpace::new("falcon");
        assert_eq!(keys.rate_counter(4), "falcon:rate-inbox-limits-4");
        assert_eq!(keys.campaign_counter(4), "falcon:mailbox_msg_count_4");
        assert_eq!(keys.inbox_settings(4), "falcon:inboxes-settings-cache_4");
        assert_eq!(keys.channel_subscribers(4), "falcon/channels/inboxes/4");
        assert_eq!(keys.client_messages("abc"), "falcon/clients/abc/messages");
        assert_eq!(keys.clients(), "falcon/clients");
        assert_eq!(keys.notifications_channel(), "falcon/notifications/messages");
        assert_eq!(keys.job_queues(), "falcon:queues");
        assert_eq!(keys.job_queue("mail"), "falcon:queue:mail");
    }

    #[test]
    fn test_bare_keys() {
        let keys = KeySpace::default();
        assert_eq!(keys.rate_counter(1), "rate-inbox-limits-1");
        assert_eq!(keys.channel_subscribers(1), "/channels/inboxes/1");
        assert_eq!(keys.job_queue("mail"), "queue:mail");
    }
}
