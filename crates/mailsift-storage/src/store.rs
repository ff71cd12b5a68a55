//! Storage contract consumed by the pipeline

use async_trait::async_trait;
use mailsift_common::types::{
    Attachment, AttachmentId, InboxSettings, MailboxId, MessageId, ParsedMessage, ScanReport,
};
use mailsift_common::Result;

/// Source of per-message storage sessions
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Acquire a session; the underlying connection is released when it drops
    async fn acquire(&self) -> Result<Box<dyn StoreSession>>;
}

/// One checked-out storage connection
#[async_trait]
pub trait StoreSession: Send {
    /// Fetch the policy of a mailbox; a missing mailbox is an error
    async fn inbox_settings(&mut self, mailbox_id: MailboxId) -> Result<InboxSettings>;

    /// Store a parsed message and return its generated id
    async fn insert_message(&mut self, message: &ParsedMessage) -> Result<MessageId>;

    /// Store one attachment of a stored message
    async fn insert_attachment(
        &mut self,
        mailbox_id: MailboxId,
        message_id: MessageId,
        attachment: &Attachment,
    ) -> Result<AttachmentId>;

    /// Insert or replace the spam report of a message
    async fn save_spam_report(&mut self, report: &ScanReport) -> Result<()>;

    /// Insert or replace the malware report of a message
    async fn save_virus_report(&mut self, report: &ScanReport) -> Result<()>;

    /// Delete the oldest messages of a mailbox beyond `keep`, attachments
    /// included, and return the deleted ids
    async fn prune_messages(&mut self, mailbox_id: MailboxId, keep: u32)
        -> Result<Vec<MessageId>>;
}

/// Truncate to at most `max` characters on a char boundary
pub(crate) fn truncate_chars(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("まみむめも", 2), "まみ");
        assert_eq!(truncate_chars("", 0), "");
    }
}
