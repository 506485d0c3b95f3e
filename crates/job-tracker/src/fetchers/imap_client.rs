//! IMAP fetcher for providers without a mail API (iCloud, Yahoo, Fastmail...).
//!
//! Messages are identified as `<email>:<uidvalidity>:<uid>` so that ids stay
//! stable across runs and change if the server renumbers the mailbox.

use super::{snippet_from, strip_html, EmailFetcher};
use crate::config::AccountConfig;
use anyhow::{Context, Result};
use async_imap::Session;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use job_types::EmailMessage;
use mailparse::{MailHeaderMap, ParsedMail};

type AsyncTcpStream = async_io::Async<std::net::TcpStream>;
type TlsStream = async_native_tls::TlsStream<AsyncTcpStream>;

pub struct ImapFetcher {
    account_name: String,
    email: String,
    server: String,
    port: u16,
    password: String,
    mailbox: String,
}

impl ImapFetcher {
    pub fn from_account(account: &AccountConfig) -> Result<Self> {
        let server = account
            .imap_server
            .clone()
            .context("IMAP account needs imap_server")?;
        Ok(Self {
            account_name: account.name.clone(),
            email: account.email.clone(),
            server,
            port: account.imap_port,
            password: account.imap_password()?,
            mailbox: account.mailbox.clone(),
        })
    }

    async fn connect(&self) -> Result<Session<TlsStream>> {
        let addr = tokio::net::lookup_host((self.server.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to resolve {}", self.server))?
            .next()
            .with_context(|| format!("No address for {}", self.server))?;

        let tcp = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            AsyncTcpStream::connect(addr),
        )
        .await
        .context("Timed out connecting to IMAP server")?
        .context("Failed to connect to IMAP server")?;

        let tls_stream = TlsConnector::new()
            .connect(&self.server, tcp)
            .await
            .context("TLS handshake failed")?;

        let client = async_imap::Client::new(tls_stream);

        client
            .login(&self.email, &self.password)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Login failed for {}: {}", self.email, e))
    }

    async fn fetch_with_session(
        &self,
        session: &mut Session<TlsStream>,
        since: DateTime<Utc>,
        max: u32,
    ) -> Result<Vec<EmailMessage>> {
        // EXAMINE is read-only so fetched mail stays unread
        let mailbox = session
            .examine(&self.mailbox)
            .await
            .with_context(|| format!("Failed to open mailbox {}", self.mailbox))?;
        let uid_validity = mailbox.uid_validity.unwrap_or(0);

        let uids = session
            .uid_search(since_query(since))
            .await
            .context("IMAP search failed")?;

        let uid_set = newest_uids(uids, max);
        if uid_set.is_empty() {
            return Ok(vec![]);
        }

        let messages: Vec<_> = session
            .uid_fetch(&uid_set, "(UID INTERNALDATE BODY.PEEK[])")
            .await
            .context("Failed to fetch messages")?
            .try_collect()
            .await?;

        let mut emails = Vec::new();
        for message in &messages {
            let Some(uid) = message.uid else { continue };
            let Some(raw) = message.body() else { continue };

            let id = format!("{}:{}:{}", self.email, uid_validity, uid);
            let internal_date = message.internal_date().map(|d| d.with_timezone(&Utc));

            match parse_raw_email(raw, id, &self.account_name, internal_date) {
                // SINCE only has day granularity
                Ok(email) if email.received_at >= since => emails.push(email),
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to parse email {}: {}", uid, e),
            }
        }

        emails.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(emails)
    }
}

#[async_trait]
impl EmailFetcher for ImapFetcher {
    async fn fetch_since(&self, since: DateTime<Utc>, max: u32) -> Result<Vec<EmailMessage>> {
        let mut session = self.connect().await?;
        let result = self.fetch_with_session(&mut session, since, max).await;

        if let Err(e) = session.logout().await {
            tracing::debug!("IMAP logout failed: {}", e);
        }

        result
    }
}

fn since_query(since: DateTime<Utc>) -> String {
    format!("SINCE {}", since.format("%d-%b-%Y"))
}

/// Comma-separated set of the `max` highest UIDs
fn newest_uids(uids: impl IntoIterator<Item = u32>, max: u32) -> String {
    let mut uids: Vec<u32> = uids.into_iter().collect();
    uids.sort_unstable();
    let skip = uids.len().saturating_sub(max as usize);

    uids[skip..]
        .iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_raw_email(
    raw: &[u8],
    id: String,
    account_name: &str,
    internal_date: Option<DateTime<Utc>>,
) -> Result<EmailMessage> {
    let parsed = mailparse::parse_mail(raw)?;
    let headers = parsed.get_headers();

    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let from = headers.get_first_value("From").unwrap_or_default();
    let received_at = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .or(internal_date)
        .unwrap_or_else(Utc::now);

    let (text, html) = extract_bodies(&parsed);
    let body = text.or_else(|| html.map(|h| strip_html(&h)));
    let snippet = body.as_deref().map(snippet_from).unwrap_or_default();

    Ok(EmailMessage {
        id,
        account_name: account_name.to_string(),
        subject,
        from,
        snippet,
        body,
        received_at,
    })
}

fn extract_bodies(parsed: &ParsedMail) -> (Option<String>, Option<String>) {
    let mut text = None;
    let mut html = None;
    collect_bodies(parsed, &mut text, &mut html);
    (text, html)
}

fn collect_bodies(part: &ParsedMail, text: &mut Option<String>, html: &mut Option<String>) {
    if part.subparts.is_empty() {
        let is_attachment = part
            .get_headers()
            .get_first_value("Content-Disposition")
            .map(|d| d.to_ascii_lowercase().starts_with("attachment"))
            .unwrap_or(false);
        if is_attachment {
            return;
        }

        match part.ctype.mimetype.as_str() {
            "text/plain" if text.is_none() => *text = part.get_body().ok(),
            "text/html" if html.is_none() => *html = part.get_body().ok(),
            _ => {}
        }
        return;
    }

    for sub in &part.subparts {
        collect_bodies(sub, text, html);
    }
}
