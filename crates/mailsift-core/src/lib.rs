//! mailsift core - inbound mail processing
//!
//! This crate provides the per-message pipeline: MIME parsing, header
//! decoding, storage, spam and malware scanning, per-mailbox rate limiting
//! and notification fan-out.

pub mod cache;
pub mod decode;
pub mod limits;
pub mod notify;
pub mod parser;
pub mod pipeline;
pub mod scan;
pub mod settings;

pub use cache::{Cache, KeySpace, MemoryCache, RedisCache};
pub use decode::{decode_header, DecodeError};
pub use limits::RateLimiter;
pub use notify::{
    DispatchHandle, JobQueueNotifier, NotificationDispatcher, Notifier, PubSubNotifier,
    WebhookNotifier,
};
pub use parser::{MessageParser, MimeParser};
pub use pipeline::{envelope_queue, start_workers, Delivery, Intake, Pipeline, WorkerPool};
pub use scan::{ClamavClient, SpamAssassinClient, SpamScanner, VirusScanner};
pub use settings::SettingsCache;
