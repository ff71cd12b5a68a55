//! MIME parsing collaborator backed by `mail-parser`

use crate::decode::{collapse_adjacent_words, decode_header};
use chrono::{TimeZone, Utc};
use mail_parser::{Address, MessageParser as MimeMessageParser, MimeHeaders};
use mailsift_common::types::{Attachment, MailAddress, ParsedMessage, RawEnvelope};
use mailsift_common::{Error, Result};

/// Turns raw bytes into a [`ParsedMessage`]
pub trait MessageParser: Send + Sync {
    /// Parse one envelope; the same bytes always give the same result
    fn parse(&self, envelope: &RawEnvelope) -> Result<ParsedMessage>;
}

/// Parser using `mail-parser` for MIME structure and the header decoder
/// for subject, display names and filenames
#[derive(Debug, Clone, Default)]
pub struct MimeParser;

impl MimeParser {
    pub fn new() -> Self {
        Self
    }
}

impl MessageParser for MimeParser {
    fn parse(&self, envelope: &RawEnvelope) -> Result<ParsedMessage> {
        let parsed = MimeMessageParser::default()
            .parse(envelope.data())
            .ok_or_else(|| Error::Parse("Failed to parse message".to_string()))?;

        // Prefer the raw header so encoded words go through our own decoder
        let subject = parsed
            .header_raw("Subject")
            .map(|raw| decode_header(&collapse_adjacent_words(raw)))
            .or_else(|| parsed.subject().map(decode_header))
            .unwrap_or_default();

        let date = parsed
            .date()
            .and_then(|d| Utc.timestamp_opt(d.to_timestamp(), 0).single());

        let attachments = parsed
            .attachments()
            .map(|part| {
                let content_type = part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string())
                    .to_ascii_lowercase();

                let disposition = part
                    .content_disposition()
                    .map(|d| d.ctype().to_ascii_lowercase())
                    .filter(|d| d == "inline")
                    .unwrap_or_else(|| "attachment".to_string());

                Attachment {
                    filename: part.attachment_name().map(decode_header).unwrap_or_default(),
                    disposition,
                    content_type,
                    content_id: part
                        .content_id()
                        .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>'))
                        .unwrap_or_default()
                        .to_string(),
                    transfer_encoding: part
                        .content_transfer_encoding()
                        .map(|e| e.trim().to_ascii_lowercase())
                        .unwrap_or_default(),
                    body: part.contents().to_vec(),
                }
            })
            .collect();

        Ok(ParsedMessage {
            mailbox_id: envelope.mailbox_id,
            subject,
            date,
            from: first_address(parsed.from()),
            to: first_address(parsed.to()),
            text_body: parsed
                .body_text(0)
                .map(|s| s.into_owned())
                .unwrap_or_default(),
            html_body: parsed
                .body_html(0)
                .map(|s| s.into_owned())
                .unwrap_or_default(),
            attachments,
            raw: envelope.shared_data(),
        })
    }
}

fn first_address(address: Option<&Address<'_>>) -> MailAddress {
    address
        .and_then(|a| a.first())
        .map(|addr| MailAddress {
            address: addr.address().unwrap_or_default().to_string(),
            name: addr.name().unwrap_or_default().to_string(),
        })
        .unwrap_or_default()
}
