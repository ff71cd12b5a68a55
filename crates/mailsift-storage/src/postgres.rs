//! PostgreSQL storage adapter

use crate::db::DatabasePool;
use crate::store::{truncate_chars, MailStore, StoreSession};
use async_trait::async_trait;
use mailsift_common::types::{
    Attachment, AttachmentId, InboxSettings, MailboxId, MessageId, ParsedMessage, ScanReport,
};
use mailsift_common::{Error, Result};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Postgres, Row};
use tracing::debug;

const MAX_SUBJECT_CHARS: usize = 1000;
const MAX_FIELD_CHARS: usize = 255;

/// Storage backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgMailStore {
    pool: DatabasePool,
}

impl PgMailStore {
    /// Create a new store
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MailStore for PgMailStore {
    async fn acquire(&self) -> Result<Box<dyn StoreSession>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgStoreSession { conn }))
    }
}

/// Session holding one pooled connection
pub struct PgStoreSession {
    conn: PoolConnection<Postgres>,
}

impl PgStoreSession {
    async fn upsert_report(&mut self, table: &str, report: &ScanReport) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (message_id, mailbox_id, report)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id)
            DO UPDATE SET report = EXCLUDED.report, updated_at = NOW()
            "#
        );

        sqlx::query(&sql)
            .bind(report.message_id)
            .bind(report.mailbox_id)
            .bind(&report.verdict)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl StoreSession for PgStoreSession {
    async fn inbox_settings(&mut self, mailbox_id: MailboxId) -> Result<InboxSettings> {
        let row = sqlx::query("SELECT max_messages, rate_limit FROM inboxes WHERE id = $1")
            .bind(mailbox_id)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|e| Error::Database(e.to_string()))?
            .ok_or_else(|| Error::Storage(format!("Inbox {} not found", mailbox_id)))?;

        let max_messages: i32 = row
            .try_get("max_messages")
            .map_err(|e| Error::Database(e.to_string()))?;
        let rate_limit: i32 = row
            .try_get("rate_limit")
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(InboxSettings {
            max_messages: max_messages.max(0) as u32,
            rate_limit: rate_limit.max(0) as u32,
        })
    }

    async fn insert_message(&mut self, message: &ParsedMessage) -> Result<MessageId> {
        let row = sqlx::query(
            r#"
            INSERT INTO messages (
                mailbox_id, subject, sent_at, from_address, from_name,
                to_address, to_name, text_body, html_body, raw, size
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(message.mailbox_id)
        .bind(truncate_chars(&message.subject, MAX_SUBJECT_CHARS))
        .bind(message.date)
        .bind(truncate_chars(&message.from.address, MAX_FIELD_CHARS))
        .bind(truncate_chars(&message.from.name, MAX_FIELD_CHARS))
        .bind(truncate_chars(&message.to.address, MAX_FIELD_CHARS))
        .bind(truncate_chars(&message.to.name, MAX_FIELD_CHARS))
        .bind(&message.text_body)
        .bind(&message.html_body)
        .bind(message.raw())
        .bind(message.raw().len() as i64)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.try_get::<i64, _>("id")
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn insert_attachment(
        &mut self,
        mailbox_id: MailboxId,
        message_id: MessageId,
        attachment: &Attachment,
    ) -> Result<AttachmentId> {
        let row = sqlx::query(
            r#"
            INSERT INTO attachments (
                message_id, mailbox_id, filename, disposition, content_type,
                content_id, transfer_encoding, body, size
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(message_id)
        .bind(mailbox_id)
        .bind(truncate_chars(&attachment.filename, MAX_FIELD_CHARS))
        .bind(&attachment.disposition)
        .bind(truncate_chars(&attachment.content_type, MAX_FIELD_CHARS))
        .bind(truncate_chars(&attachment.content_id, MAX_FIELD_CHARS))
        .bind(&attachment.transfer_encoding)
        .bind(&attachment.body)
        .bind(attachment.body.len() as i64)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.try_get::<i64, _>("id")
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn save_spam_report(&mut self, report: &ScanReport) -> Result<()> {
        self.upsert_report("spam_reports", report).await
    }

    async fn save_virus_report(&mut self, report: &ScanReport) -> Result<()> {
        self.upsert_report("virus_reports", report).await
    }

    async fn prune_messages(
        &mut self,
        mailbox_id: MailboxId,
        keep: u32,
    ) -> Result<Vec<MessageId>> {
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let ids: Vec<i64> = sqlx::query(
            r#"
            SELECT id FROM messages
            WHERE mailbox_id = $1
            ORDER BY created_at DESC, id DESC
            OFFSET $2
            "#,
        )
        .bind(mailbox_id)
        .bind(i64::from(keep))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .iter()
        .map(|row| row.try_get::<i64, _>("id"))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Database(e.to_string()))?;

        if ids.is_empty() {
            tx.commit()
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            return Ok(ids);
        }

        sqlx::query("DELETE FROM attachments WHERE message_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query("DELETE FROM messages WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        debug!(mailbox_id, deleted = ids.len(), "Pruned messages beyond retention");
        Ok(ids)
    }
}
