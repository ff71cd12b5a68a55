//! In-memory storage adapter for tests and dry runs

use crate::store::{MailStore, StoreSession};
use async_trait::async_trait;
use mailsift_common::types::{
    Attachment, AttachmentId, InboxSettings, MailboxId, MessageId, ParsedMessage, ScanReport,
};
use mailsift_common::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A stored message as kept by [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub message: ParsedMessage,
}

/// A stored attachment as kept by [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub id: AttachmentId,
    pub mailbox_id: MailboxId,
    pub message_id: MessageId,
    pub attachment: Attachment,
}

#[derive(Default)]
struct State {
    inboxes: HashMap<MailboxId, InboxSettings>,
    messages: BTreeMap<MessageId, StoredMessage>,
    attachments: BTreeMap<AttachmentId, StoredAttachment>,
    spam_reports: HashMap<MessageId, ScanReport>,
    virus_reports: HashMap<MessageId, ScanReport>,
    next_message_id: MessageId,
    next_attachment_id: AttachmentId,
    fail_acquire: bool,
    failing_filenames: HashSet<String>,
    settings_lookups: usize,
}

/// Storage kept in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    open_sessions: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox with its settings
    pub async fn add_inbox(&self, mailbox_id: MailboxId, settings: InboxSettings) {
        self.state.lock().await.inboxes.insert(mailbox_id, settings);
    }

    /// Make every following `acquire` fail
    pub async fn fail_acquire(&self, fail: bool) {
        self.state.lock().await.fail_acquire = fail;
    }

    /// Make inserting attachments with this filename fail
    pub async fn fail_attachment(&self, filename: impl Into<String>) {
        self.state
            .lock()
            .await
            .failing_filenames
            .insert(filename.into());
    }

    /// Sessions currently checked out
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Number of times inbox settings were read from storage
    pub async fn settings_lookups(&self) -> usize {
        self.state.lock().await.settings_lookups
    }

    /// Stored messages of a mailbox, oldest first
    pub async fn messages(&self, mailbox_id: MailboxId) -> Vec<StoredMessage> {
        self.state
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.message.mailbox_id == mailbox_id)
            .cloned()
            .collect()
    }

    /// Stored attachments of a message
    pub async fn attachments(&self, message_id: MessageId) -> Vec<StoredAttachment> {
        self.state
            .lock()
            .await
            .attachments
            .values()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect()
    }

    /// Total number of stored attachments
    pub async fn attachment_count(&self) -> usize {
        self.state.lock().await.attachments.len()
    }

    /// Spam report of a message
    pub async fn spam_report(&self, message_id: MessageId) -> Option<ScanReport> {
        self.state.lock().await.spam_reports.get(&message_id).cloned()
    }

    /// All malware reports
    pub async fn virus_reports(&self) -> Vec<ScanReport> {
        self.state
            .lock()
            .await
            .virus_reports
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn acquire(&self) -> Result<Box<dyn StoreSession>> {
        if self.state.lock().await.fail_acquire {
            return Err(Error::Database("connection refused".to_string()));
        }
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            open_sessions: Arc::clone(&self.open_sessions),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<State>>,
    open_sessions: Arc<AtomicUsize>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn inbox_settings(&mut self, mailbox_id: MailboxId) -> Result<InboxSettings> {
        let mut state = self.state.lock().await;
        state.settings_lookups += 1;
        state
            .inboxes
            .get(&mailbox_id)
            .copied()
            .ok_or_else(|| Error::Storage(format!("Inbox {} not found", mailbox_id)))
    }

    async fn insert_message(&mut self, message: &ParsedMessage) -> Result<MessageId> {
        let mut state = self.state.lock().await;
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.insert(
            id,
            StoredMessage {
                id,
                message: message.clone(),
            },
        );
        Ok(id)
    }

    async fn insert_attachment(
        &mut self,
        mailbox_id: MailboxId,
        message_id: MessageId,
        attachment: &Attachment,
    ) -> Result<AttachmentId> {
        let mut state = self.state.lock().await;
        if state.failing_filenames.contains(&attachment.filename) {
            return Err(Error::Database(format!(
                "failed to insert attachment {}",
                attachment.filename
            )));
        }
        state.next_attachment_id += 1;
        let id = state.next_attachment_id;
        state.attachments.insert(
            id,
            StoredAttachment {
                id,
                mailbox_id,
                message_id,
                attachment: attachment.clone(),
            },
        );
        Ok(id)
    }

    async fn save_spam_report(&mut self, report: &ScanReport) -> Result<()> {
        let mut state = self.state.lock().await;
        state.spam_reports.insert(report.message_id, report.clone());
        Ok(())
    }

    async fn save_virus_report(&mut self, report: &ScanReport) -> Result<()> {
        let mut state = self.state.lock().await;
        state.virus_reports.insert(report.message_id, report.clone());
        Ok(())
    }

    async fn prune_messages(
        &mut self,
        mailbox_id: MailboxId,
        keep: u32,
    ) -> Result<Vec<MessageId>> {
        let mut state = self.state.lock().await;

        let mut ids: Vec<MessageId> = state
            .messages
            .values()
            .filter(|m| m.message.mailbox_id == mailbox_id)
            .map(|m| m.id)
            .collect();
        // newest first
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let doomed: Vec<MessageId> = ids.into_iter().skip(keep as usize).collect();

        for id in &doomed {
            state.messages.remove(id);
            state.spam_reports.remove(id);
            state.virus_reports.remove(id);
        }
        state
            .attachments
            .retain(|_, a| !doomed.contains(&a.message_id));

        Ok(doomed)
    }
}
