//! Per-message processing pipeline
//!
//! A [`Pipeline`] takes one [`RawEnvelope`] from storage through scanning
//! to notification. Stages after the message insert are best-effort: their
//! failures are logged and the remaining stages still run.

pub mod pool;

pub use pool::{envelope_queue, start_workers, EnvelopeReceiver, Intake, WorkerPool};

use crate::limits::RateLimiter;
use crate::notify::DispatchHandle;
use crate::parser::MessageParser;
use crate::scan::{SpamScanner, VirusScanner};
use crate::settings::SettingsCache;
use mailsift_common::types::{
    Credentials, MailboxId, MessageId, NotificationEvent, RawEnvelope, ScanReport, ScannerKind,
};
use mailsift_common::Result;
use mailsift_storage::{MailStore, StoreSession};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of processing one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub attachments_stored: usize,
    pub attachments_failed: usize,
    /// Messages removed by retention
    pub pruned: Vec<MessageId>,
    pub spam_report_stored: bool,
    /// Malware verdict when the scan succeeded, empty meaning clean
    pub virus_verdict: Option<String>,
    pub notified: bool,
}

impl Delivery {
    fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            ..Default::default()
        }
    }
}

struct Notifications {
    handle: DispatchHandle,
    credentials: Credentials,
}

/// Storage, scanning and notification for inbound messages
pub struct Pipeline {
    store: Arc<dyn MailStore>,
    parser: Arc<dyn MessageParser>,
    settings: SettingsCache,
    limiter: RateLimiter,
    spam_scanner: Option<Arc<dyn SpamScanner>>,
    virus_scanner: Option<Arc<dyn VirusScanner>>,
    notifications: Option<Notifications>,
    retention: bool,
}

impl Pipeline {
    /// Create a pipeline with scanning and notifications disabled and
    /// retention enabled
    pub fn new(
        store: Arc<dyn MailStore>,
        parser: Arc<dyn MessageParser>,
        settings: SettingsCache,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            store,
            parser,
            settings,
            limiter,
            spam_scanner: None,
            virus_scanner: None,
            notifications: None,
            retention: true,
        }
    }

    pub fn with_spam_scanner(mut self, scanner: Arc<dyn SpamScanner>) -> Self {
        self.spam_scanner = Some(scanner);
        self
    }

    pub fn with_virus_scanner(mut self, scanner: Arc<dyn VirusScanner>) -> Self {
        self.virus_scanner = Some(scanner);
        self
    }

    pub fn with_notifications(mut self, handle: DispatchHandle, credentials: Credentials) -> Self {
        self.notifications = Some(Notifications {
            handle,
            credentials,
        });
        self
    }

    pub fn with_retention(mut self, enabled: bool) -> Self {
        self.retention = enabled;
        self
    }

    /// Process one message.
    ///
    /// Errors are returned only for the stages that abandon the message:
    /// acquiring a session, loading settings, parsing and the message insert.
    /// The session is released on every path.
    pub async fn process(&self, envelope: &RawEnvelope) -> Result<Delivery> {
        let mailbox_id = envelope.mailbox_id;

        let mut session = self.store.acquire().await?;
        let settings = self.settings.fetch(session.as_mut(), mailbox_id).await?;
        let message = self.parser.parse(envelope)?;
        let message_id = session.insert_message(&message).await?;
        let mut delivery = Delivery::new(message_id);

        for attachment in &message.attachments {
            match session
                .insert_attachment(mailbox_id, message_id, attachment)
                .await
            {
                Ok(_) => delivery.attachments_stored += 1,
                Err(e) => {
                    warn!(
                        "Failed to store attachment {:?} of message {}: {}",
                        attachment.filename, message_id, e
                    );
                    delivery.attachments_failed += 1;
                }
            }
        }

        if self.retention && settings.has_retention_limit() {
            match session
                .prune_messages(mailbox_id, settings.max_messages)
                .await
            {
                Ok(pruned) => {
                    if !pruned.is_empty() {
                        debug!(
                            "Pruned {} messages from mailbox {}",
                            pruned.len(),
                            mailbox_id
                        );
                    }
                    delivery.pruned = pruned;
                }
                Err(e) => warn!("Retention failed for mailbox {}: {}", mailbox_id, e),
            }
        }

        if let Some(scanner) = &self.spam_scanner {
            delivery.spam_report_stored = self
                .spam_scan(session.as_mut(), scanner.as_ref(), mailbox_id, message_id, message.raw())
                .await;
        }

        if let Some(scanner) = &self.virus_scanner {
            delivery.virus_verdict = self
                .virus_scan(session.as_mut(), scanner.as_ref(), mailbox_id, message_id, message.raw())
                .await;
        }

        if let Some(notifications) = &self.notifications {
            if self.limiter.is_within_campaign_budget(mailbox_id).await {
                delivery.notified = notifications.handle.dispatch(NotificationEvent {
                    mailbox_id,
                    message_id,
                    credentials: notifications.credentials.clone(),
                });
            } else {
                debug!(
                    "Mailbox {} over campaign budget, notification suppressed",
                    mailbox_id
                );
            }
        }

        drop(session);
        Ok(delivery)
    }

    async fn spam_scan(
        &self,
        session: &mut dyn StoreSession,
        scanner: &dyn SpamScanner,
        mailbox_id: MailboxId,
        message_id: MessageId,
        raw: &[u8],
    ) -> bool {
        let verdict = match scanner.report(raw).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Spam scan of message {} failed: {:#}", message_id, e);
                return false;
            }
        };

        let report = ScanReport {
            scanner: ScannerKind::SpamAssassin,
            mailbox_id,
            message_id,
            verdict,
        };
        match session.save_spam_report(&report).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to save spam report of message {}: {}", message_id, e);
                false
            }
        }
    }

    async fn virus_scan(
        &self,
        session: &mut dyn StoreSession,
        scanner: &dyn VirusScanner,
        mailbox_id: MailboxId,
        message_id: MessageId,
        raw: &[u8],
    ) -> Option<String> {
        let verdict = match scanner.scan(raw).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Malware scan of message {} failed: {:#}", message_id, e);
                return None;
            }
        };

        let report = ScanReport {
            scanner: ScannerKind::Clamav,
            mailbox_id,
            message_id,
            verdict,
        };
        if !report.is_clean() {
            warn!(
                "Message {} flagged by malware scan: {}",
                message_id, report.verdict
            );
            if let Err(e) = session.save_virus_report(&report).await {
                warn!("Failed to save malware report of message {}: {}", message_id, e);
            }
        }

        Some(report.verdict)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::{Cache, KeySpace, MemoryCache};
    use crate::notify::{NotificationDispatcher, Notifier};
    use crate::parser::MimeParser;
    use async_trait::async_trait;
    use mailsift_common::config::{LimitsConfig, NotificationConfig};
    use mailsift_common::types::InboxSettings;
    use mailsift_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) const MESSAGE: &[u8] = b"From: Sender <sender@example.com>\r\n\
To: inbox@example.com\r\n\
Subject: Quarterly report\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--b1\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQ=\r\n\
--b1\r\n\
Content-Type: image/png\r\n\
Content-Disposition: attachment; filename=\"logo.png\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--b1--\r\n";

    struct FixedVerdict(&'static str);

    #[async_trait]
    impl VirusScanner for FixedVerdict {
        async fn scan(&self, _payload: &[u8]) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[async_trait]
    impl SpamScanner for FixedVerdict {
        async fn report(&self, _payload: &[u8]) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl VirusScanner for Unreachable {
        async fn scan(&self, _payload: &[u8]) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    #[async_trait]
    impl SpamScanner for Unreachable {
        async fn report(&self, _payload: &[u8]) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    #[derive(Default)]
    struct Recording {
        events: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn notify(&self, _event: &NotificationEvent) -> anyhow::Result<()> {
            self.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn pipeline(store: &MemoryStore, cache: &MemoryCache) -> Pipeline {
        let shared: Arc<dyn Cache> = Arc::new(cache.clone());
        let keys = KeySpace::new("test");
        Pipeline::new(
            Arc::new(store.clone()),
            Arc::new(MimeParser::new()),
            SettingsCache::new(shared.clone(), keys.clone(), Duration::from_secs(60)),
            RateLimiter::new(shared, keys, LimitsConfig::default()),
        )
    }

    pub(crate) async fn store_with_inbox(max_messages: u32) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .add_inbox(
                1,
                InboxSettings {
                    max_messages,
                    rate_limit: 0,
                },
            )
            .await;
        store
    }

    fn envelope() -> RawEnvelope {
        RawEnvelope::new(1, MESSAGE.to_vec())
    }

    #[tokio::test]
    async fn test_stores_message_and_attachments() {
        let store = store_with_inbox(0).await;
        let pipeline = pipeline(&store, &MemoryCache::new());

        let delivery = pipeline.process(&envelope()).await.unwrap();

        let messages = store.messages(1).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, delivery.message_id);
        assert_eq!(messages[0].message.subject, "Quarterly report");
        assert_eq!(delivery.attachments_stored, 2);
        assert_eq!(delivery.attachments_failed, 0);
        assert_eq!(store.attachments(delivery.message_id).await.len(), 2);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_malware_verdict_persisted() {
        let store = store_with_inbox(0).await;
        let pipeline = pipeline(&store, &MemoryCache::new())
            .with_virus_scanner(Arc::new(FixedVerdict("Eicar-Test-Signature")));

        let delivery = pipeline.process(&envelope()).await.unwrap();

        let reports = store.virus_reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].verdict, "Eicar-Test-Signature");
        assert_eq!(reports[0].message_id, delivery.message_id);
        assert_eq!(reports[0].scanner, ScannerKind::Clamav);
    }

    #[tokio::test]
    async fn test_clean_verdict_not_persisted() {
        let store = store_with_inbox(0).await;
        let pipeline =
            pipeline(&store, &MemoryCache::new()).with_virus_scanner(Arc::new(FixedVerdict("")));

        let delivery = pipeline.process(&envelope()).await.unwrap();

        assert_eq!(delivery.virus_verdict.as_deref(), Some(""));
        assert!(store.virus_reports().await.is_empty());
    }

    #[tokio::test]
    async fn test_spam_report_saved() {
        let store = store_with_inbox(0).await;
        let pipeline = pipeline(&store, &MemoryCache::new())
            .with_spam_scanner(Arc::new(FixedVerdict("Content analysis details: 0.1 points")));

        let delivery = pipeline.process(&envelope()).await.unwrap();

        assert!(delivery.spam_report_stored);
        let report = store.spam_report(delivery.message_id).await.unwrap();
        assert_eq!(report.verdict, "Content analysis details: 0.1 points");
        assert_eq!(report.scanner, ScannerKind::SpamAssassin);
    }

    #[tokio::test]
    async fn test_scanner_failures_do_not_abort() {
        let store = store_with_inbox(0).await;
        let pipeline = pipeline(&store, &MemoryCache::new())
            .with_spam_scanner(Arc::new(Unreachable))
            .with_virus_scanner(Arc::new(Unreachable));

        let delivery = pipeline.process(&envelope()).await.unwrap();

        assert!(!delivery.spam_report_stored);
        assert_eq!(delivery.virus_verdict, None);
        assert!(store.spam_report(delivery.message_id).await.is_none());
        assert_eq!(store.messages(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest() {
        let store = store_with_inbox(5).await;
        let pipeline = pipeline(&store, &MemoryCache::new());

        let mut ids = Vec::new();
        for _ in 0..5 {
            let delivery = pipeline.process(&envelope()).await.unwrap();
            assert!(delivery.pruned.is_empty());
            ids.push(delivery.message_id);
        }
        let sixth = pipeline.process(&envelope()).await.unwrap();

        assert_eq!(sixth.pruned, vec![ids[0]]);
        let remaining: Vec<MessageId> = store.messages(1).await.iter().map(|m| m.id).collect();
        assert_eq!(remaining.len(), 5);
        assert!(!remaining.contains(&ids[0]));
        assert!(remaining.contains(&sixth.message_id));
        assert!(store.attachments(ids[0]).await.is_empty());
        assert_eq!(store.attachment_count().await, 10);
    }

    #[tokio::test]
    async fn test_retention_disabled() {
        let store = store_with_inbox(5).await;
        let pipeline = pipeline(&store, &MemoryCache::new()).with_retention(false);

        for _ in 0..6 {
            pipeline.process(&envelope()).await.unwrap();
        }
        assert_eq!(store.messages(1).await.len(), 6);
    }

    #[tokio::test]
    async fn test_attachment_failure_does_not_abort() {
        let store = store_with_inbox(0).await;
        store.fail_attachment("report.pdf").await;
        let pipeline = pipeline(&store, &MemoryCache::new())
            .with_spam_scanner(Arc::new(FixedVerdict("report")));

        let delivery = pipeline.process(&envelope()).await.unwrap();

        assert_eq!(delivery.attachments_stored, 1);
        assert_eq!(delivery.attachments_failed, 1);
        let stored = store.attachments(delivery.message_id).await;
        assert_eq!(stored[0].attachment.filename, "logo.png");
        assert!(delivery.spam_report_stored);
    }

    #[tokio::test]
    async fn test_acquire_failure_abandons_message() {
        let store = store_with_inbox(0).await;
        store.fail_acquire(true).await;
        let pipeline = pipeline(&store, &MemoryCache::new());

        assert!(pipeline.process(&envelope()).await.is_err());
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_missing_inbox_releases_session() {
        let store = MemoryStore::new();
        let pipeline = pipeline(&store, &MemoryCache::new());

        assert!(pipeline.process(&envelope()).await.is_err());
        assert!(store.messages(1).await.is_empty());
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_campaign_suppresses_notifications() {
        let store = store_with_inbox(0).await;
        let recording = Arc::new(Recording::default());
        let notifiers: Vec<Arc<dyn Notifier>> = vec![recording.clone()];
        let dispatcher = NotificationDispatcher::start(notifiers, &NotificationConfig::default());
        let pipeline = pipeline(&store, &MemoryCache::new())
            .with_notifications(dispatcher.handle(), Credentials::default());

        let mut notified = Vec::new();
        for _ in 0..12 {
            notified.push(pipeline.process(&envelope()).await.unwrap().notified);
        }
        drop(pipeline);
        dispatcher.shutdown().await;

        assert_eq!(notified.iter().filter(|n| **n).count(), 9);
        assert!(notified[..9].iter().all(|n| *n));
        assert_eq!(recording.events.load(Ordering::SeqCst), 9);
        assert_eq!(store.messages(1).await.len(), 12);
    }
}
