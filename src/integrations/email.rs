//! IMAP mail source.
//!
//! Fetches UNSEEN messages from INBOX over TLS with `BODY.PEEK[]` and parses
//! them with `mail-parser`. Messages stay unseen until the caller
//! acknowledges them by UID. The IMAP exchange is blocking and always runs
//! inside `spawn_blocking`.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

// ── Configuration ───────────────────────────────────────────────────

/// IMAP connection settings, built from environment variables.
#[derive(Debug)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub poll_interval_secs: u64,
    pub max_poll_interval_secs: u64,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (email sync disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST")
            .ok()
            .filter(|h| !h.trim().is_empty())?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());

        let poll_interval_secs: u64 = std::env::var("EMAIL_POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let max_poll_interval_secs: u64 = std::env::var("EMAIL_MAX_POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3600);

        Some(Self {
            imap_host,
            imap_port,
            username,
            password,
            poll_interval_secs,
            max_poll_interval_secs,
        })
    }
}

// ── Received mail ───────────────────────────────────────────────────

/// Attachment metadata. Contents are not kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
}

/// One parsed inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedEmail {
    /// `Message-ID` header, used as the dedup key.
    pub message_id: Option<String>,
    pub from: String,
    /// Comma-separated recipient addresses.
    pub to: String,
    pub subject: String,
    pub body: String,
    pub date: Option<DateTime<Utc>>,
    pub attachments: Vec<AttachmentInfo>,
}

/// A fetched message and the mailbox UID used to acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMail {
    pub uid: u32,
    pub email: ReceivedEmail,
}

/// Anything that can hand over newly arrived mail.
///
/// Fetching does not consume: a message keeps coming back from
/// `fetch_new` until its UID is passed to `mark_seen`.
#[async_trait]
pub trait MailSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch messages not yet acknowledged. A failure here is transient.
    async fn fetch_new(&self) -> Result<Vec<FetchedMail>, SyncError>;

    /// Acknowledge messages so later fetches skip them.
    async fn mark_seen(&self, uids: &[u32]) -> Result<(), SyncError>;
}

// ── IMAP source ─────────────────────────────────────────────────────

pub struct ImapMailSource {
    config: Arc<EmailConfig>,
}

impl ImapMailSource {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn transient(&self, reason: String) -> SyncError {
        SyncError::Transient {
            source_name: self.name().to_string(),
            reason,
        }
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_new(&self) -> Result<Vec<FetchedMail>, SyncError> {
        let cfg = Arc::clone(&self.config);
        match tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg)).await {
            Ok(Ok(messages)) => {
                tracing::debug!(count = messages.len(), host = %self.config.imap_host, "Fetched unseen mail");
                Ok(messages)
            }
            Ok(Err(e)) => Err(self.transient(format!("IMAP fetch failed: {e}"))),
            Err(e) => Err(self.transient(format!("IMAP fetch task panicked: {e}"))),
        }
    }

    async fn mark_seen(&self, uids: &[u32]) -> Result<(), SyncError> {
        if uids.is_empty() {
            return Ok(());
        }
        let cfg = Arc::clone(&self.config);
        let set = uid_set(uids);
        match tokio::task::spawn_blocking(move || mark_seen_imap(&cfg, &set)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.transient(format!("IMAP store failed: {e}"))),
            Err(e) => Err(self.transient(format!("IMAP store task panicked: {e}"))),
        }
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    addr.map(|a| {
        a.iter()
            .filter_map(|a| a.address())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

fn extract_date(parsed: &mail_parser::Message) -> Option<DateTime<Utc>> {
    let d = parsed.date()?;
    let naive = chrono::NaiveDate::from_ymd_opt(
        i32::from(d.year),
        u32::from(d.month),
        u32::from(d.day),
    )?
    .and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))?;
    let offset = i64::from(d.tz_hour) * 3600 + i64::from(d.tz_minute) * 60;
    let utc = naive.and_utc();
    // `tz_before_gmt` means the local time is behind UTC.
    Some(if d.tz_before_gmt {
        utc + chrono::Duration::seconds(offset)
    } else {
        utc - chrono::Duration::seconds(offset)
    })
}

fn extract_attachments(parsed: &mail_parser::Message) -> Vec<AttachmentInfo> {
    parsed
        .attachments()
        .map(|part| {
            let content_type = MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into());
            AttachmentInfo {
                filename: MimeHeaders::attachment_name(part)
                    .unwrap_or("attachment")
                    .to_string(),
                content_type,
                size: part.contents().len(),
            }
        })
        .collect()
}

/// Parse a raw RFC 822 message.
pub fn parse_message(raw: &[u8]) -> Option<ReceivedEmail> {
    let parsed = MessageParser::default().parse(raw)?;
    Some(ReceivedEmail {
        message_id: parsed.message_id().map(str::to_string),
        from: addresses(parsed.from())
            .into_iter()
            .next()
            .unwrap_or_else(|| "unknown".into()),
        to: addresses(parsed.to()).join(", "),
        subject: parsed.subject().unwrap_or("").to_string(),
        body: extract_text(&parsed),
        date: extract_date(&parsed),
        attachments: extract_attachments(&parsed),
    })
}

/// Comma-separated UID set for `UID STORE`.
fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// UID from an untagged `* n FETCH (UID 42 BODY[] {..}` line.
fn fetch_uid(line: &str) -> Option<u32> {
    let mut words = line.split_whitespace();
    words.find(|w| w.trim_start_matches('(').eq_ignore_ascii_case("UID"))?;
    words.next()?.trim_end_matches(')').parse().ok()
}

/// Quote a string for an IMAP command argument.
fn imap_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── IMAP exchange ───────────────────────────────────────────────────

type ImapError = Box<dyn std::error::Error + Send + Sync>;
type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn read_line(tls: &mut TlsStream) -> Result<String, ImapError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err("IMAP connection closed".into()),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, ImapError> {
    IoWrite::write_all(tls, format!("{tag} {cmd}\r\n").as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            return Ok(lines);
        }
    }
}

/// Open a TLS session, log in and select INBOX (blocking).
fn open_inbox(config: &EmailConfig) -> Result<TlsStream, ImapError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let _greeting = read_line(&mut tls)?;

    let login = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN {} {}",
            imap_quote(&config.username),
            imap_quote(config.password.expose_secret())
        ),
    )?;
    if !login.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;
    Ok(tls)
}

/// Fetch unseen messages without setting `\Seen` (blocking).
///
/// Unparseable messages are flagged seen here, since no retry can ingest them.
fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<FetchedMail>, ImapError> {
    let mut tls = open_inbox(config)?;

    let search = send_cmd(&mut tls, "A3", "UID SEARCH UNSEEN")?;
    let uids: Vec<u32> = search
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2).filter_map(|w| w.parse().ok()))
        .collect();

    let mut results = Vec::new();
    let mut unparseable = Vec::new();
    let mut tag_counter = 4_u32;

    for uid in uids {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch = send_cmd(&mut tls, &fetch_tag, &format!("UID FETCH {uid} BODY.PEEK[]"))?;
        let uid = fetch.first().and_then(|l| fetch_uid(l)).unwrap_or(uid);

        // Drop the untagged FETCH line, the closing paren and the tagged status.
        let raw: String = fetch
            .iter()
            .skip(1)
            .take(fetch.len().saturating_sub(3))
            .cloned()
            .collect();

        match parse_message(raw.as_bytes()) {
            Some(email) => results.push(FetchedMail { uid, email }),
            None => {
                tracing::warn!(imap_uid = uid, "Skipping unparseable message");
                unparseable.push(uid);
            }
        }
    }

    if !unparseable.is_empty() {
        let store_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let cmd = format!("UID STORE {} +FLAGS (\\Seen)", uid_set(&unparseable));
        if let Err(e) = send_cmd(&mut tls, &store_tag, &cmd) {
            tracing::warn!(count = unparseable.len(), "Failed to flag unparseable mail: {e}");
        }
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(results)
}

/// Flag the given UIDs `\Seen` (blocking).
fn mark_seen_imap(config: &EmailConfig, uid_set: &str) -> Result<(), ImapError> {
    let mut tls = open_inbox(config)?;
    let store = send_cmd(
        &mut tls,
        "A3",
        &format!("UID STORE {uid_set} +FLAGS (\\Seen)"),
    )?;
    let _ = send_cmd(&mut tls, "A4", "LOGOUT");
    if !store.last().is_some_and(|l| l.contains("OK")) {
        return Err(format!("IMAP store rejected for {uid_set}").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RAW: &str = "Message-ID: <abc123@mail.example.com>\r\n\
From: Alice <alice@example.com>\r\n\
To: Support <support@example.com>, billing@example.com\r\n\
Subject: Invoice overdue\r\n\
Date: Tue, 1 Jul 2025 10:30:00 +0200\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Please pay invoice 42.\r\n";

    #[test]
    fn parses_headers_and_body() {
        let email = parse_message(RAW.as_bytes()).unwrap();
        assert_eq!(email.message_id.as_deref(), Some("abc123@mail.example.com"));
        assert_eq!(email.from, "alice@example.com");
        assert_eq!(email.to, "support@example.com, billing@example.com");
        assert_eq!(email.subject, "Invoice overdue");
        assert_eq!(email.body, "Please pay invoice 42.");
        assert!(email.attachments.is_empty());
    }

    #[test]
    fn date_is_normalized_to_utc() {
        let email = parse_message(RAW.as_bytes()).unwrap();
        assert_eq!(
            email.date,
            Some(Utc.with_ymd_and_hms(2025, 7, 1, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn collects_attachment_metadata() {
        let raw = "From: bob@example.com\r\n\
To: team@example.com\r\n\
Subject: Report\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
See attached.\r\n\
--XX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
\r\n\
PDFDATA\r\n\
--XX--\r\n";
        let email = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(email.body, "See attached.");
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].filename, "report.pdf");
        assert_eq!(email.attachments[0].content_type, "application/pdf");
        assert!(email.message_id.is_none());
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(
            strip_html("<div><b>Bold</b>  and <i>italic</i></div>"),
            "Bold and italic"
        );
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn uid_parsing_and_sets() {
        assert_eq!(fetch_uid("* 3 FETCH (UID 42 BODY[] {120}\r\n"), Some(42));
        assert_eq!(fetch_uid("* 3 FETCH (BODY[] {120} UID 7)\r\n"), Some(7));
        assert_eq!(fetch_uid("* 3 FETCH (BODY[] {120}\r\n"), None);
        assert_eq!(uid_set(&[4, 9, 12]), "4,9,12");
    }

    #[test]
    fn imap_quote_escapes() {
        assert_eq!(imap_quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn config_from_env_returns_none_when_no_host() {
        // SAFETY: no other test reads EMAIL_IMAP_HOST.
        unsafe { std::env::remove_var("EMAIL_IMAP_HOST") };
        assert!(EmailConfig::from_env().is_none());
    }
}
