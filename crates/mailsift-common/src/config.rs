//! Configuration for mailsift

use crate::types::Credentials;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis cache configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// ClamAV daemon configuration
    #[serde(default)]
    pub clamav: ClamavConfig,

    /// SpamAssassin daemon configuration
    #[serde(default)]
    pub spamassassin: SpamAssassinConfig,

    /// Rate limit and campaign detection
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Notification fan-out
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the envelope queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Delete oldest messages beyond the mailbox maximum
    #[serde(default = "default_retention_enabled")]
    pub retention_enabled: bool,

    /// Freshness window of cached inbox settings in seconds
    #[serde(default = "default_settings_cache_ttl")]
    pub settings_cache_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            retention_enabled: default_retention_enabled(),
            settings_cache_ttl_secs: default_settings_cache_ttl(),
        }
    }
}

impl PipelineConfig {
    pub fn settings_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.settings_cache_ttl_secs)
    }
}

fn default_workers() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    256
}

fn default_retention_enabled() -> bool {
    true
}

fn default_settings_cache_ttl() -> u64 {
    4 * 60 * 60 // 4 hours
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable the Redis cache; without it an in-process cache is used
    #[serde(default)]
    pub enabled: bool,

    /// Redis URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key namespace for subscriber and job queue keys
    #[serde(default)]
    pub namespace: String,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            namespace: String::new(),
            timeout_ms: default_redis_timeout(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_timeout() -> u64 {
    2000
}

/// ClamAV daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClamavConfig {
    /// Scan stored messages for malware
    #[serde(default)]
    pub enabled: bool,

    /// clamd TCP address
    #[serde(default = "default_clamav_address")]
    pub address: String,

    /// Timeout for the whole exchange in milliseconds
    #[serde(default = "default_scanner_timeout")]
    pub timeout_ms: u64,

    /// INSTREAM chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Treat a response without a `stream:` verdict as an error instead of clean
    #[serde(default)]
    pub fail_closed: bool,
}

impl Default for ClamavConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_clamav_address(),
            timeout_ms: default_scanner_timeout(),
            chunk_size: default_chunk_size(),
            fail_closed: false,
        }
    }
}

impl ClamavConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_clamav_address() -> String {
    "127.0.0.1:3310".to_string()
}

fn default_chunk_size() -> usize {
    1024
}

fn default_scanner_timeout() -> u64 {
    30_000
}

/// SpamAssassin daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamAssassinConfig {
    /// Score stored messages with spamd
    #[serde(default)]
    pub enabled: bool,

    /// spamd TCP address
    #[serde(default = "default_spamd_address")]
    pub address: String,

    /// Timeout for the whole exchange in milliseconds
    #[serde(default = "default_scanner_timeout")]
    pub timeout_ms: u64,
}

impl Default for SpamAssassinConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_spamd_address(),
            timeout_ms: default_scanner_timeout(),
        }
    }
}

impl SpamAssassinConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_spamd_address() -> String {
    "127.0.0.1:783".to_string()
}

/// Rate limit and campaign detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Messages allowed per rate window when the mailbox has no own limit
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Rate window length in seconds
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,

    /// Messages per campaign window after which notifications stop
    #[serde(default = "default_campaign_ceiling")]
    pub campaign_ceiling: u32,

    /// Campaign window length in seconds
    #[serde(default = "default_campaign_window")]
    pub campaign_window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            rate_window_secs: default_rate_window(),
            campaign_ceiling: default_campaign_ceiling(),
            campaign_window_secs: default_campaign_window(),
        }
    }
}

impl LimitsConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn campaign_window(&self) -> Duration {
        Duration::from_secs(self.campaign_window_secs)
    }
}

fn default_rate_limit() -> u32 {
    2
}

fn default_rate_window() -> u64 {
    1
}

fn default_campaign_ceiling() -> u32 {
    10
}

fn default_campaign_window() -> u64 {
    20
}

/// Notification fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Dispatch notifications after storing a message
    #[serde(default)]
    pub enabled: bool,

    /// Subscriber credentials; subscriber fan-out is active when both are set
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Job queue name for background job enqueueing
    pub job_queue: Option<String>,

    /// Job class for background job enqueueing
    pub job_class: Option<String>,

    /// HTTP callback URLs
    #[serde(default)]
    pub webhooks: Vec<String>,

    /// Secret used to sign HTTP callbacks
    pub webhook_secret: Option<String>,

    /// HTTP callback timeout in milliseconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_ms: u64,

    /// Subscribers not seen for this many seconds get their queue pruned
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Deliveries running at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Events waiting for delivery before new ones are dropped
    #[serde(default = "default_backlog")]
    pub backlog: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            password: String::new(),
            job_queue: None,
            job_class: None,
            webhooks: Vec::new(),
            webhook_secret: None,
            timeout_ms: default_webhook_timeout(),
            stale_after_secs: default_stale_after(),
            max_in_flight: default_max_in_flight(),
            backlog: default_backlog(),
        }
    }
}

impl NotificationConfig {
    /// Credentials, when subscriber fan-out is configured
    pub fn credentials(&self) -> Option<Credentials> {
        if self.username.is_empty() || self.password.is_empty() {
            return None;
        }
        Some(Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    /// Job queue name and class, when job enqueueing is configured
    pub fn job_target(&self) -> Option<(&str, &str)> {
        match (self.job_queue.as_deref(), self.job_class.as_deref()) {
            (Some(queue), Some(class)) if !queue.is_empty() && !class.is_empty() => {
                Some((queue, class))
            }
            _ => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

fn default_webhook_timeout() -> u64 {
    5000
}

fn default_stale_after() -> u64 {
    60
}

fn default_max_in_flight() -> usize {
    8
}

fn default_backlog() -> usize {
    1024
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load a file layered with `MAILSIFT__SECTION__KEY` environment overrides
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path.to_path_buf()))
            .add_source(
                ::config::Environment::with_prefix("MAILSIFT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./mailsift.toml"),
            PathBuf::from("/etc/mailsift/mailsift.toml"),
        ];

        for path in paths {
            if path.exists() {
                tracing::info!(path = %path.display(), "Loading configuration");
                return Self::load_from(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    fn validate(&self) -> crate::Result<()> {
        if self.pipeline.workers == 0 {
            return Err(crate::Error::Config(
                "pipeline.workers must be at least 1".to_string(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "pipeline.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.clamav.chunk_size == 0 {
            return Err(crate::Error::Config(
                "clamav.chunk_size must be at least 1".to_string(),
            ));
        }
        if self.notifications.max_in_flight == 0 || self.notifications.backlog == 0 {
            return Err(crate::Error::Config(
                "notifications.max_in_flight and notifications.backlog must be at least 1"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
