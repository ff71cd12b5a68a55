//! ClamAV integration for malware scanning
//!
//! Streams the message to `clamd` with the INSTREAM command:
//! `nINSTREAM\n`, then length-prefixed chunks, then a zero-length chunk.

use super::{read_lines, VirusScanner};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mailsift_common::config::ClamavConfig;
use regex::Regex;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// clamd TCP client
pub struct ClamavClient {
    address: String,
    timeout: Duration,
    chunk_size: usize,
    fail_closed: bool,
    verdict: Regex,
}

impl ClamavClient {
    /// Create a new ClamAV client
    pub fn new(config: &ClamavConfig) -> Result<Self> {
        Ok(Self {
            address: config.address.clone(),
            timeout: config.timeout(),
            chunk_size: config.chunk_size.max(1),
            fail_closed: config.fail_closed,
            verdict: Regex::new(r"(?i)^stream:\s*(.*)")?,
        })
    }

    /// Scan a payload, returning "" when clean or the signature name
    pub async fn scan(&self, payload: &[u8]) -> Result<String> {
        tokio::time::timeout(self.timeout, self.exchange(payload))
            .await
            .map_err(|_| anyhow!("clamd scan timed out after {:?}", self.timeout))?
    }

    /// Check that clamd answers `PONG`
    pub async fn ping(&self) -> Result<()> {
        tokio::time::timeout(self.timeout, self.ping_exchange())
            .await
            .map_err(|_| anyhow!("clamd ping timed out after {:?}", self.timeout))?
    }

    async fn ping_exchange(&self) -> Result<()> {
        let mut stream = self.connect().await?;
        stream.write_all(b"nPING\n").await?;
        let lines = read_lines(&mut stream).await?;
        let reply = lines.join("");
        if reply.trim() == "PONG" {
            Ok(())
        } else {
            Err(anyhow!("Unexpected clamd PING reply: {:?}", reply))
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Failed to connect to clamd at {}", self.address))
    }

    async fn exchange(&self, payload: &[u8]) -> Result<String> {
        debug!("Scanning {} bytes with clamd at {}", payload.len(), self.address);

        let mut stream = self.connect().await?;
        stream
            .write_all(b"nINSTREAM\n")
            .await
            .context("Failed to send INSTREAM command")?;
        write_instream(&mut stream, payload, self.chunk_size)
            .await
            .context("Failed to stream payload to clamd")?;
        stream.flush().await?;

        let lines = read_lines(&mut stream)
            .await
            .context("Failed to read clamd response")?;
        self.parse_verdict(&lines.join("\n"))
    }

    /// Interpret a clamd response
    pub fn parse_verdict(&self, response: &str) -> Result<String> {
        let response = response.trim();
        match self.verdict.captures(response) {
            Some(caps) => {
                let verdict = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                if verdict.eq_ignore_ascii_case("ok") {
                    Ok(String::new())
                } else {
                    Ok(verdict.to_string())
                }
            }
            None if self.fail_closed => Err(anyhow!("Unexpected clamd response: {:?}", response)),
            None => {
                warn!("Unexpected clamd response, treating as clean: {:?}", response);
                Ok(String::new())
            }
        }
    }
}

#[async_trait]
impl VirusScanner for ClamavClient {
    async fn scan(&self, payload: &[u8]) -> Result<String> {
        ClamavClient::scan(self, payload).await
    }
}

/// Write a payload as INSTREAM chunks, each prefixed by its big-endian
/// length, followed by the four-byte zero terminator
pub async fn write_instream<W>(writer: &mut W, payload: &[u8], chunk_size: usize) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in payload.chunks(chunk_size.max(1)) {
        writer.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
        writer.write_all(chunk).await?;
    }
    writer.write_all(&[0u8; 4]).await
}
