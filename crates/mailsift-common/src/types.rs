//! Common types for mailsift

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifier of a destination mailbox (inbox)
pub type MailboxId = i64;

/// Identifier generated by storage for a stored message
pub type MessageId = i64;

/// Identifier generated by storage for a stored attachment
pub type AttachmentId = i64;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// A fully received raw message handed off by a front end.
///
/// The bytes are shared, never copied, between the envelope and the
/// parsed message that is produced from it.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    pub mailbox_id: MailboxId,
    data: Arc<[u8]>,
}

impl RawEnvelope {
    /// Create a new envelope for a mailbox
    pub fn new(mailbox_id: MailboxId, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            mailbox_id,
            data: data.into(),
        }
    }

    /// Raw message bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the raw bytes
    pub fn shared_data(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    /// Size of the raw message in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the raw message is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Address and display name pair from a From/To header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAddress {
    pub address: String,
    pub name: String,
}

impl MailAddress {
    /// Create a new address
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for MailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "<{}>", self.address)
        } else {
            write!(f, "{} <{}>", self.name, self.address)
        }
    }
}

/// One MIME part classified as an attachment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    /// Decoded filename
    pub filename: String,
    /// Disposition kind: "attachment" or "inline"
    pub disposition: String,
    /// Media type, e.g. "image/png"
    pub content_type: String,
    /// Content-ID without angle brackets
    pub content_id: String,
    /// Lower-cased Content-Transfer-Encoding
    pub transfer_encoding: String,
    /// Decoded body
    pub body: Vec<u8>,
}

/// A message after the parsing collaborator has run
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub mailbox_id: MailboxId,
    pub subject: String,
    /// Date header; absent when missing or unparseable
    pub date: Option<Timestamp>,
    pub from: MailAddress,
    pub to: MailAddress,
    pub text_body: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
    pub raw: Arc<[u8]>,
}

impl ParsedMessage {
    /// Raw message bytes
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Per-mailbox policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxSettings {
    /// Maximum number of retained messages, 0 means unlimited
    pub max_messages: u32,
    /// Inbound messages allowed per rate window, 0 means use the default
    pub rate_limit: u32,
}

impl InboxSettings {
    /// Whether message-count retention applies to this mailbox
    pub fn has_retention_limit(&self) -> bool {
        self.max_messages > 0
    }
}

/// Scanner that produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerKind {
    SpamAssassin,
    Clamav,
}

impl std::fmt::Display for ScannerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScannerKind::SpamAssassin => write!(f, "spamassassin"),
            ScannerKind::Clamav => write!(f, "clamav"),
        }
    }
}

/// Result of one scan, written once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanner: ScannerKind,
    pub mailbox_id: MailboxId,
    pub message_id: MessageId,
    /// Free-text verdict, empty meaning clean
    pub verdict: String,
}

impl ScanReport {
    /// Whether the scanner found nothing
    pub fn is_clean(&self) -> bool {
        self.verdict.is_empty()
    }
}

/// Credentials echoed to subscribers so they can authenticate the event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A "new message" event, alive only for the duration of the fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub mailbox_id: MailboxId,
    pub message_id: MessageId,
    pub credentials: Credentials,
}

impl NotificationEvent {
    /// Subscriber channel for the mailbox
    pub fn channel(&self) -> String {
        format!("/inboxes/{}", self.mailbox_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shares_bytes() {
        let envelope = RawEnvelope::new(3, b"Subject: hi\r\n\r\nbody".to_vec());
        let shared = envelope.shared_data();
        assert_eq!(envelope.len(), 19);
        assert_eq!(&shared[..], envelope.data());
        assert!(!envelope.is_empty());
    }

    #[test]
    fn test_mail_address_display() {
        assert_eq!(
            MailAddress::new("jorg@example.com", "Jörg Doe").to_string(),
            "Jörg Doe <jorg@example.com>"
        );
        assert_eq!(
            MailAddress::new("anon@example.com", "").to_string(),
            "<anon@example.com>"
        );
    }

    #[test]
    fn test_notification_channel() {
        let event = NotificationEvent {
            mailbox_id: 12,
            message_id: 99,
            credentials: Credentials::default(),
        };
        assert_eq!(event.channel(), "/inboxes/12");
    }

    #[test]
    fn test_scanner_kind_display() {
        assert_eq!(ScannerKind::Clamav.to_string(), "clamav");
        assert_eq!(ScannerKind::SpamAssassin.to_string(), "spamassassin");
    }

    #[test]
    fn test_retention_limit() {
        assert!(!InboxSettings::default().has_retention_limit());
        assert!(InboxSettings {
            max_messages: 5,
            rate_limit: 0
        }
        .has_retention_limit());
    }
}
