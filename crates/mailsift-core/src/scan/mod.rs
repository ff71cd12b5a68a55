//! Scanner daemon clients
//!
//! Provides screening through:
//! - ClamAV (`clamd` INSTREAM protocol) for malware
//! - SpamAssassin (`spamd` REPORT protocol) for spam

pub mod clamav;
pub mod spamassassin;

pub use clamav::{write_instream, ClamavClient};
pub use spamassassin::{SpamAssassinClient, SpamdReport, SpamdRule};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Malware scanner returning a verdict, empty when clean
#[async_trait]
pub trait VirusScanner: Send + Sync {
    async fn scan(&self, payload: &[u8]) -> Result<String>;
}

/// Spam scanner returning a free-text report
#[async_trait]
pub trait SpamScanner: Send + Sync {
    async fn report(&self, payload: &[u8]) -> Result<String>;
}

/// Read a response to EOF and return its lines without terminators
pub(crate) async fn read_lines<R>(reader: &mut R) -> std::io::Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf)
        .lines()
        .map(str::to_string)
        .collect())
}
