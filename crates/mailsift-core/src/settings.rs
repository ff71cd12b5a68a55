//! Inbox settings served from the cache with a fixed freshness window

use crate::cache::{Cache, KeySpace};
use mailsift_common::types::{InboxSettings, MailboxId};
use mailsift_common::Result;
use mailsift_storage::StoreSession;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_MESSAGES_FIELD: &str = "max_messages";
const RATE_LIMIT_FIELD: &str = "rate_limit";

/// Read-through cache of [`InboxSettings`]. Entries are never invalidated,
/// they expire after the TTL.
#[derive(Clone)]
pub struct SettingsCache {
    cache: Arc<dyn Cache>,
    keys: KeySpace,
    ttl: Duration,
}

impl SettingsCache {
    pub fn new(cache: Arc<dyn Cache>, keys: KeySpace, ttl: Duration) -> Self {
        Self { cache, keys, ttl }
    }

    /// Cached settings, if present and readable
    pub async fn cached(&self, mailbox_id: MailboxId) -> Option<InboxSettings> {
        let fields = match self
            .cache
            .hash_get_all(&self.keys.inbox_settings(mailbox_id))
            .await
        {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Failed to read cached settings for mailbox {}: {}", mailbox_id, e);
                return None;
            }
        };

        let max_messages = fields.get(MAX_MESSAGES_FIELD)?.parse().ok()?;
        let rate_limit = fields
            .get(RATE_LIMIT_FIELD)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Some(InboxSettings {
            max_messages,
            rate_limit,
        })
    }

    /// Cached settings, or load them from storage and populate the cache
    pub async fn fetch(
        &self,
        session: &mut dyn StoreSession,
        mailbox_id: MailboxId,
    ) -> Result<InboxSettings> {
        if let Some(settings) = self.cached(mailbox_id).await {
            return Ok(settings);
        }

        debug!("Settings cache miss for mailbox {}", mailbox_id);
        let settings = session.inbox_settings(mailbox_id).await?;

        let fields = [
            (
                MAX_MESSAGES_FIELD.to_string(),
                settings.max_messages.to_string(),
            ),
            (RATE_LIMIT_FIELD.to_string(), settings.rate_limit.to_string()),
        ];
        if let Err(e) = self
            .cache
            .hash_set_with_expiry(&self.keys.inbox_settings(mailbox_id), &fields, self.ttl)
            .await
        {
            warn!("Failed to cache settings for mailbox {}: {}", mailbox_id, e);
        }

        Ok(settings)
    }
}
