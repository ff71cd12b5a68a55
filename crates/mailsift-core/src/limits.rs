//! Rate Limiter - inbound flood and spam-campaign detection per mailbox

use crate::cache::{Cache, KeySpace};
use mailsift_common::config::LimitsConfig;
use mailsift_common::types::MailboxId;
use mailsift_common::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters kept in the shared cache; they only grow and reset by expiry
#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    keys: KeySpace,
    config: LimitsConfig,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(cache: Arc<dyn Cache>, keys: KeySpace, config: LimitsConfig) -> Self {
        Self {
            cache,
            keys,
            config,
        }
    }

    /// Default threshold for mailboxes without their own limit
    pub fn default_threshold(&self) -> u32 {
        self.config.rate_limit
    }

    /// Record one inbound message for the mailbox
    pub async fn record_one(&self, mailbox_id: MailboxId) -> Result<i64> {
        self.cache
            .incr_with_expiry(&self.keys.rate_counter(mailbox_id), self.config.rate_window())
            .await
    }

    /// Whether the mailbox is over the default threshold
    pub async fn is_blocked(&self, mailbox_id: MailboxId) -> bool {
        self.is_blocked_at(mailbox_id, self.config.rate_limit).await
    }

    /// Whether the mailbox's current window holds more than `threshold` messages.
    ///
    /// A missing counter or a cache failure means not blocked.
    pub async fn is_blocked_at(&self, mailbox_id: MailboxId, threshold: u32) -> bool {
        match self
            .cache
            .get_counter(&self.keys.rate_counter(mailbox_id))
            .await
        {
            Ok(Some(count)) => {
                let blocked = count > i64::from(threshold);
                if blocked {
                    debug!(
                        "Rate limit hit for mailbox {}: {} > {}",
                        mailbox_id, count, threshold
                    );
                }
                blocked
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Rate limit check failed for mailbox {}: {}", mailbox_id, e);
                false
            }
        }
    }

    /// Count one message against the campaign window and report whether the
    /// mailbox is still below the ceiling. Cache failures allow delivery.
    pub async fn is_within_campaign_budget(&self, mailbox_id: MailboxId) -> bool {
        match self
            .cache
            .incr_with_expiry(
                &self.keys.campaign_counter(mailbox_id),
                self.config.campaign_window(),
            )
            .await
        {
            Ok(count) => count < i64::from(self.config.campaign_ceiling),
            Err(e) => {
                warn!(
                    "Campaign counter failed for mailbox {}: {}",
                    mailbox_id, e
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::time::Duration;

    fn limiter(cache: &MemoryCache) -> RateLimiter {
        RateLimiter::new(
            Arc::new(cache.clone()),
            KeySpace::new("test"),
            LimitsConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_after_threshold() {
        let cache = MemoryCache::new();
        let limiter = limiter(&cache);

        assert!(!limiter.is_blocked(1).await);
        for _ in 0..2 {
            limiter.record_one(1).await.unwrap();
        }
        assert!(!limiter.is_blocked(1).await);

        limiter.record_one(1).await.unwrap();
        assert!(limiter.is_blocked(1).await);
        assert!(!limiter.is_blocked(2).await);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(!limiter.is_blocked(1).await);
    }

    #[tokio::test]
    async fn test_custom_threshold() {
        let cache = MemoryCache::new();
        let limiter = limiter(&cache);
        for _ in 0..5 {
            limiter.record_one(3).await.unwrap();
        }
        assert!(limiter.is_blocked_at(3, 4).await);
        assert!(!limiter.is_blocked_at(3, 5).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_budget() {
        let cache = MemoryCache::new();
        let limiter = limiter(&cache);

        for n in 1..10 {
            assert!(limiter.is_within_campaign_budget(1).await, "call {}", n);
        }
        assert!(!limiter.is_within_campaign_budget(1).await);
        assert!(!limiter.is_within_campaign_budget(1).await);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(limiter.is_within_campaign_budget(1).await);
    }

    #[tokio::test]
    async fn test_cache_failure_fails_open() {
        let cache = MemoryCache::new();
        let limiter = limiter(&cache);
        cache.set_failing(true).await;

        assert!(!limiter.is_blocked(1).await);
        assert!(limiter.is_within_campaign_budget(1).await);
        assert!(limiter.record_one(1).await.is_err());
    }
}
