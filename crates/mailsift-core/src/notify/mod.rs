//! Notification fan-out
//!
//! A "new message" event is delivered best-effort through every configured
//! [`Notifier`]: subscriber queues, background job queues and HTTP
//! callbacks. Delivery runs detached from the pipeline on a
//! [`NotificationDispatcher`].

pub mod dispatcher;
pub mod jobqueue;
pub mod pubsub;
pub mod webhook;

pub use dispatcher::{DispatchHandle, NotificationDispatcher};
pub use jobqueue::JobQueueNotifier;
pub use pubsub::PubSubNotifier;
pub use webhook::WebhookNotifier;

use anyhow::Result;
use async_trait::async_trait;
use mailsift_common::types::NotificationEvent;
use serde::Serialize;

/// One delivery path for notification events
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Deliver one event
    async fn notify(&self, event: &NotificationEvent) -> Result<()>;
}

/// JSON body delivered to subscribers and HTTP callbacks
#[derive(Debug, Clone, Serialize)]
pub struct EventPayload<'a> {
    pub channel: String,
    pub ext: PayloadCredentials<'a>,
    pub data: PayloadData,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayloadCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Ids are sent as strings
#[derive(Debug, Clone, Serialize)]
pub struct PayloadData {
    pub mailbox_id: String,
    pub message_id: String,
}

impl<'a> From<&'a NotificationEvent> for EventPayload<'a> {
    fn from(event: &'a NotificationEvent) -> Self {
        Self {
            channel: event.channel(),
            ext: PayloadCredentials {
                username: &event.credentials.username,
                password: &event.credentials.password,
            },
            data: PayloadData {
                mailbox_id: event.mailbox_id.to_string(),
                message_id: event.message_id.to_string(),
            },
        }
    }
}

impl EventPayload<'_> {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsift_common::types::Credentials;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_payload_shape() {
        let event = NotificationEvent {
            mailbox_id: 12,
            message_id: 345,
            credentials: Credentials {
                username: "hook".to_string(),
                password: "secret".to_string(),
            },
        };

        let value: serde_json::Value =
            serde_json::from_str(&EventPayload::from(&event).to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "channel": "/inboxes/12",
                "ext": {"username": "hook", "password": "secret"},
                "data": {"mailbox_id": "12", "message_id": "345"}
            })
        );
    }
}
