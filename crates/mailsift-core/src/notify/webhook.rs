//! HTTP callback delivery with HMAC signatures and per-URL circuit breakers

use super::{EventPayload, Notifier};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use mailsift_common::types::NotificationEvent;
use reqwest::Client;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Circuit breaker state for a callback URL
#[derive(Debug, Clone, Default)]
struct CircuitBreakerState {
    failure_count: u32,
    last_failure: Option<Instant>,
    is_open: bool,
}

/// Posts events to configured callback URLs
pub struct WebhookNotifier {
    http_client: Client,
    urls: Vec<String>,
    secret: Option<String>,
    circuit_breakers: Arc<RwLock<HashMap<String, CircuitBreakerState>>>,
    /// Maximum consecutive failures before circuit opens
    circuit_threshold: u32,
    /// Time to wait before retrying after circuit opens
    circuit_reset_timeout: Duration,
}

impl WebhookNotifier {
    /// Create a new webhook notifier
    pub fn new(urls: Vec<String>, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            urls,
            secret,
            circuit_breakers: Arc::new(RwLock::new(HashMap::new())),
            circuit_threshold: 5,
            circuit_reset_timeout: Duration::from_secs(60),
        })
    }

    /// `sha256=<hex>` signature of a body
    fn sign(secret: &str, body: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow!("Invalid HMAC key: {}", e))?;
        mac.update(body);
        Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
    }

    async fn post(&self, url: &str, body: &[u8]) -> Result<()> {
        let mut request = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json");

        if let Some(ref secret) = self.secret {
            request = request.header("X-Webhook-Signature", Self::sign(secret, body)?);
        }

        let response = request.body(body.to_vec()).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("Callback returned status {}", response.status()));
        }
        Ok(())
    }

    /// Check if circuit breaker is open for a URL
    async fn is_circuit_open(&self, url: &str) -> bool {
        let breakers = self.circuit_breakers.read().await;

        match breakers.get(url) {
            Some(state) if state.is_open => state
                .last_failure
                .is_some_and(|at| at.elapsed() < self.circuit_reset_timeout),
            _ => false,
        }
    }

    async fn record_success(&self, url: &str) {
        let mut breakers = self.circuit_breakers.write().await;
        let state = breakers.entry(url.to_string()).or_default();

        state.failure_count = 0;
        state.is_open = false;
    }

    async fn record_failure(&self, url: &str) {
        let mut breakers = self.circuit_breakers.write().await;
        let state = breakers.entry(url.to_string()).or_default();

        state.failure_count += 1;
        state.last_failure = Some(Instant::now());

        if state.failure_count >= self.circuit_threshold {
            state.is_open = true;
            warn!(
                "Circuit breaker opened for callback {} after {} failures",
                url, state.failure_count
            );
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        let body = EventPayload::from(event).to_json()?.into_bytes();

        let mut failures = 0;
        for url in &self.urls {
            if self.is_circuit_open(url).await {
                debug!("Circuit breaker open for callback {}, skipping", url);
                continue;
            }

            match self.post(url, &body).await {
                Ok(()) => self.record_success(url).await,
                Err(e) => {
                    self.record_failure(url).await;
                    warn!("Callback {} failed: {}", url, e);
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            return Err(anyhow!("{} of {} callbacks failed", failures, self.urls.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsift_common::types::Credentials;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> NotificationEvent {
        NotificationEvent {
            mailbox_id: 8,
            message_id: 21,
            credentials: Credentials {
                username: "hook".to_string(),
                password: "secret".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_signed_delivery() {
        let body = EventPayload::from(&event()).to_json().unwrap();
        let signature = WebhookNotifier::sign("shh", body.as_bytes()).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mail"))
            .and(header("Content-Type", "application/json"))
            .and(header("X-Webhook-Signature", signature.as_str()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            vec![format!("{}/mail", server.uri())],
            Some("shh".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();
        notifier.notify(&event()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(json["data"]["mailbox_id"], "8");
    }

    #[tokio::test]
    async fn test_unsigned_without_secret() {
        let server = MockServer::start().await;
        Mock::given(header_exists("X-Webhook-Signature"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(vec![server.uri()], None, Duration::from_secs(2)).unwrap();
        notifier.notify(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_isolated_per_url() {
        let server = MockServer::start().await;
        Mock::given(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(path("/ok"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            vec![
                format!("{}/broken", server.uri()),
                format!("{}/ok", server.uri()),
            ],
            None,
            Duration::from_secs(2),
        )
        .unwrap();

        let err = notifier.notify(&event()).await.unwrap_err();
        assert_eq!(err.to_string(), "1 of 2 callbacks failed");
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(5)
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(vec![server.uri()], None, Duration::from_secs(2)).unwrap();

        for _ in 0..5 {
            assert!(notifier.notify(&event()).await.is_err());
        }
        // skipped while open
        assert!(notifier.notify(&event()).await.is_ok());
        assert!(notifier.is_circuit_open(&server.uri()).await);
    }

    #[test]
    fn test_signature_format() {
        let signature = WebhookNotifier::sign("key", b"{}").unwrap();
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
    }
}
