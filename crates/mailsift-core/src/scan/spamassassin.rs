//! SpamAssassin integration for spam scoring
//!
//! Sends the message to `spamd` with the REPORT command and returns the
//! full response text.
//! See: https://svn.apache.org/repos/asf/spamassassin/trunk/spamd/PROTOCOL

use super::{read_lines, SpamScanner};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mailsift_common::config::SpamAssassinConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// spamd response header, summary and matched rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpamdReport {
    /// Protocol version, e.g. "1.1"
    pub version: String,
    /// Response code, 0 meaning EX_OK
    pub code: u32,
    /// Response message, e.g. "EX_OK"
    pub message: String,
    /// Whether spamd classified the message as spam
    pub is_spam: bool,
    /// Score of the message
    pub score: f64,
    /// Score at which a message counts as spam
    pub threshold: f64,
    /// Matched rules
    pub rules: Vec<SpamdRule>,
}

/// One matched rule from the report table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamdRule {
    pub score: f64,
    pub name: String,
    pub description: String,
}

/// Compiled patterns for reading spamd responses
struct ReportPatterns {
    header: Regex,
    summary: Regex,
    rule: Regex,
}

impl ReportPatterns {
    fn new() -> Result<Self> {
        Ok(Self {
            header: Regex::new(r"^SPAMD/(\S+) (\d+) (.+)$")?,
            summary: Regex::new(r"^Spam: (\S+) ; (\S+) / (\S+)$")?,
            rule: Regex::new(r"^\s*(-?[0-9]+(?:\.[0-9]+)?)\s+([A-Za-z0-9_]+)\s+(.*)$")?,
        })
    }

    fn parse(&self, report: &str) -> Result<SpamdReport> {
        let mut lines = report.lines();
        let first = lines.next().unwrap_or_default();
        let header = self
            .header
            .captures(first.trim_end())
            .ok_or_else(|| anyhow!("Invalid spamd response header: {:?}", first))?;

        let mut parsed = SpamdReport {
            version: header[1].to_string(),
            code: header[2].parse()?,
            message: header[3].trim().to_string(),
            ..Default::default()
        };

        for line in lines {
            let line = line.trim_end();
            if let Some(caps) = self.summary.captures(line) {
                parsed.is_spam = caps[1].eq_ignore_ascii_case("true")
                    || caps[1].eq_ignore_ascii_case("yes");
                parsed.score = caps[2].parse().unwrap_or_default();
                parsed.threshold = caps[3].parse().unwrap_or_default();
            } else if let Some(caps) = self.rule.captures(line) {
                if let Ok(score) = caps[1].parse() {
                    parsed.rules.push(SpamdRule {
                        score,
                        name: caps[2].to_string(),
                        description: caps[3].trim().to_string(),
                    });
                }
            }
        }

        Ok(parsed)
    }
}

/// spamd TCP client
pub struct SpamAssassinClient {
    address: String,
    timeout: Duration,
    patterns: ReportPatterns,
}

impl SpamAssassinClient {
    /// Create a new SpamAssassin client
    pub fn new(config: &SpamAssassinConfig) -> Result<Self> {
        Ok(Self {
            address: config.address.clone(),
            timeout: config.timeout(),
            patterns: ReportPatterns::new()?,
        })
    }

    /// Ask spamd for a report on the payload; lines are joined with `\n`
    pub async fn report(&self, payload: &[u8]) -> Result<String> {
        let report = tokio::time::timeout(self.timeout, self.exchange(payload))
            .await
            .map_err(|_| anyhow!("spamd request timed out after {:?}", self.timeout))??;

        match self.patterns.parse(&report) {
            Ok(parsed) => debug!(
                "spamd scored message {} / {} (spam: {}, {} rules)",
                parsed.score,
                parsed.threshold,
                parsed.is_spam,
                parsed.rules.len()
            ),
            Err(e) => debug!("Could not read spamd summary: {}", e),
        }

        Ok(report)
    }

    /// Parse a report returned by [`SpamAssassinClient::report`]
    pub fn parse_report(&self, report: &str) -> Result<SpamdReport> {
        self.patterns.parse(report)
    }

    async fn exchange(&self, payload: &[u8]) -> Result<String> {
        debug!("Checking {} bytes with spamd at {}", payload.len(), self.address);

        let mut stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Failed to connect to spamd at {}", self.address))?;

        stream.write_all(b"REPORT SPAMC/1.2\r\n").await?;
        stream
            .write_all(format!("Content-length: {}\r\n\r\n", payload.len()).as_bytes())
            .await?;
        stream
            .write_all(payload)
            .await
            .context("Failed to send payload to spamd")?;
        stream.shutdown().await?;

        let lines = read_lines(&mut stream)
            .await
            .context("Failed to read spamd response")?;
        Ok(lines.join("\n"))
    }
}

#[async_trait]
impl SpamScanner for SpamAssassinClient {
    async fn report(&self, payload: &[u8]) -> Result<String> {
        SpamAssassinClient::report(self, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const RESPONSE: &str = "SPAMD/1.1 0 EX_OK\r\n\
Content-length: 312\r\n\
Spam: True ; 7.9 / 5.0\r\n\
\r\n\
Content analysis details:   (7.9 points, 5.0 required)\r\n\
\r\n\
 pts rule name              description\r\n\
---- ---------------------- --------------------------------------------------\r\n\
 3.5 BAYES_99               BODY: Bayes spam probability is 99 to 100%\r\n\
 4.4 URIBL_BLACK            Contains an URL listed in the URIBL blacklist\r\n\
-0.0 NO_RELAYS              Informational: message was not relayed via SMTP\r\n";

    fn client(address: String) -> SpamAssassinClient {
        SpamAssassinClient::new(&SpamAssassinConfig {
            enabled: true,
            address,
            timeout_ms: 2000,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_report() {
        let spamd = client("127.0.0.1:0".to_string());
        let report = spamd.parse_report(RESPONSE).unwrap();

        assert_eq!(report.version, "1.1");
        assert_eq!(report.code, 0);
        assert_eq!(report.message, "EX_OK");
        assert!(report.is_spam);
        assert_eq!(report.score, 7.9);
        assert_eq!(report.threshold, 5.0);
        assert_eq!(
            report.rules.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["BAYES_99", "URIBL_BLACK", "NO_RELAYS"]
        );
        assert_eq!(report.rules[1].score, 4.4);
    }

    #[test]
    fn test_parse_invalid_header() {
        let spamd = client("127.0.0.1:0".to_string());
        assert!(spamd.parse_report("HTTP/1.1 200 OK").is_err());
    }

    #[tokio::test]
    async fn test_report_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            // the client closes its write half after the payload
            socket.read_to_end(&mut request).await.unwrap();
            socket.write_all(RESPONSE.as_bytes()).await.unwrap();
            request
        });

        let report = client(address).report(b"Subject: hi\r\n\r\nbody").await.unwrap();
        assert!(report.starts_with("SPAMD/1.1 0 EX_OK\nContent-length: 312\nSpam: True"));
        assert!(!report.contains('\r'));

        let request = server.await.unwrap();
        assert_eq!(
            String::from_utf8(request).unwrap(),
            "REPORT SPAMC/1.2\r\nContent-length: 19\r\n\r\nSubject: hi\r\n\r\nbody"
        );
    }
}
