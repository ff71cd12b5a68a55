//! mailsift - command line entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mailsift_common::config::{Config, LoggingConfig, NotificationConfig, RedisConfig};
use mailsift_common::types::{MailboxId, RawEnvelope};
use mailsift_common::Error;
use mailsift_core::{
    envelope_queue, start_workers, Cache, ClamavClient, Intake, JobQueueNotifier, KeySpace,
    MemoryCache, MimeParser, NotificationDispatcher, Notifier, Pipeline, PubSubNotifier,
    RateLimiter, RedisCache, SettingsCache, SpamAssassinClient, WebhookNotifier,
};
use mailsift_storage::{DatabasePool, MailStore, PgMailStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "mailsift", version, about = "Inbound mail processing pipeline")]
struct Cli {
    /// Configuration file (defaults to ./mailsift.toml, then /etc/mailsift/mailsift.toml)
    #[arg(short, long, global = true, env = "MAILSIFT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run raw messages through the full pipeline
    Ingest {
        /// Destination mailbox id
        #[arg(short, long)]
        mailbox: MailboxId,

        /// Raw RFC 5322 message files
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },
    /// Run the configured scanners against one message and print verdicts
    Scan {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    init_logging(&config.logging);

    match cli.command {
        Commands::Ingest { mailbox, files } => ingest(&config, mailbox, &files).await,
        Commands::Scan { file } => scan(&config, &file).await,
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

async fn connect_cache(config: &RedisConfig) -> Result<Arc<dyn Cache>> {
    if config.enabled {
        Ok(Arc::new(RedisCache::connect(config).await?))
    } else {
        warn!("Redis disabled, counters and settings are kept in process memory");
        Ok(Arc::new(MemoryCache::new()))
    }
}

fn build_notifiers(
    config: &NotificationConfig,
    cache: &Arc<dyn Cache>,
    keys: &KeySpace,
) -> Result<Vec<Arc<dyn Notifier>>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();

    if config.credentials().is_some() {
        notifiers.push(Arc::new(PubSubNotifier::new(
            Arc::clone(cache),
            keys.clone(),
            config.stale_after(),
        )));
    }

    if let Some((queue, class)) = config.job_target() {
        notifiers.push(Arc::new(JobQueueNotifier::new(
            Arc::clone(cache),
            keys.clone(),
            queue,
            class,
        )));
    }

    if !config.webhooks.is_empty() {
        notifiers.push(Arc::new(WebhookNotifier::new(
            config.webhooks.clone(),
            config.webhook_secret.clone(),
            config.timeout(),
        )?));
    }

    if notifiers.is_empty() {
        warn!("Notifications enabled but no delivery path is configured");
    }
    Ok(notifiers)
}

async fn ingest(config: &Config, mailbox_id: MailboxId, files: &[PathBuf]) -> Result<()> {
    info!("Starting mailsift pipeline...");

    let db_pool = DatabasePool::new(&config.database).await?;
    info!("Database connection established");
    db_pool.health_check().await?;
    db_pool.migrate().await?;
    info!("Database migrations completed");
    let store: Arc<dyn MailStore> = Arc::new(PgMailStore::new(db_pool));

    let cache = connect_cache(&config.redis).await?;
    let keys = KeySpace::new(config.redis.namespace.clone());
    let settings = SettingsCache::new(
        Arc::clone(&cache),
        keys.clone(),
        config.pipeline.settings_cache_ttl(),
    );
    let limiter = RateLimiter::new(Arc::clone(&cache), keys.clone(), config.limits.clone());

    let mut pipeline = Pipeline::new(
        store,
        Arc::new(MimeParser::new()),
        settings.clone(),
        limiter.clone(),
    )
    .with_retention(config.pipeline.retention_enabled);

    if config.spamassassin.enabled {
        pipeline = pipeline.with_spam_scanner(Arc::new(SpamAssassinClient::new(&config.spamassassin)?));
        info!("Spam scanning via {}", config.spamassassin.address);
    }
    if config.clamav.enabled {
        pipeline = pipeline.with_virus_scanner(Arc::new(ClamavClient::new(&config.clamav)?));
        info!("Malware scanning via {}", config.clamav.address);
    }

    let dispatcher = if config.notifications.enabled {
        let notifiers = build_notifiers(&config.notifications, &cache, &keys)?;
        let dispatcher = NotificationDispatcher::start(notifiers, &config.notifications);
        pipeline = pipeline.with_notifications(
            dispatcher.handle(),
            config.notifications.credentials().unwrap_or_default(),
        );
        Some(dispatcher)
    } else {
        info!("Notifications disabled");
        None
    };

    let (tx, receiver) = envelope_queue(config.pipeline.queue_capacity);
    let intake = Intake::new(tx, limiter, settings);
    let workers = start_workers(config.pipeline.workers, receiver, Arc::new(pipeline));

    let mut accepted = 0usize;
    let mut refused = 0usize;
    for path in files {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
                continue;
            }
        };

        match intake.submit(RawEnvelope::new(mailbox_id, data)).await {
            Ok(()) => accepted += 1,
            Err(e @ Error::RateLimitExceeded(_)) => {
                warn!("Refused {}: {}", path.display(), e);
                refused += 1;
            }
            Err(e) => {
                error!("Failed to submit {}: {}", path.display(), e);
                break;
            }
        }
    }

    // closing the queue lets the workers drain and exit
    drop(intake);
    workers.join().await;
    if let Some(dispatcher) = dispatcher {
        dispatcher.shutdown().await;
    }

    info!(accepted, refused, "mailsift ingest complete");
    Ok(())
}

async fn scan(config: &Config, file: &Path) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    if !config.spamassassin.enabled && !config.clamav.enabled {
        println!("No scanners enabled");
        return Ok(());
    }

    if config.spamassassin.enabled {
        let client = SpamAssassinClient::new(&config.spamassassin)?;
        let report = client.report(&data).await?;
        match client.parse_report(&report) {
            Ok(parsed) => println!(
                "spamassassin: {} (score {} / {}, {} rules)",
                if parsed.is_spam { "spam" } else { "ham" },
                parsed.score,
                parsed.threshold,
                parsed.rules.len()
            ),
            Err(e) => {
                warn!("Unparseable spamd report: {}", e);
                println!("spamassassin:\n{}", report);
            }
        }
    }

    if config.clamav.enabled {
        let client = ClamavClient::new(&config.clamav)?;
        client
            .ping()
            .await
            .with_context(|| format!("clamd at {} is not answering", config.clamav.address))?;
        let verdict = client.scan(&data).await?;
        if verdict.is_empty() {
            println!("clamav: clean");
        } else {
            println!("clamav: {}", verdict);
        }
    }

    Ok(())
}
