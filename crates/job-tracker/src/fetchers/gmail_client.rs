//! Gmail API client for fetching emails.

use super::{snippet_from, strip_html, EmailFetcher};
use crate::config::AccountConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_gmail1::api::{Message, MessagePart};
use google_gmail1::hyper_rustls::HttpsConnector;
use google_gmail1::yup_oauth2::authenticator::Authenticator;
use google_gmail1::yup_oauth2::{InstalledFlowAuthenticator, InstalledFlowReturnMethod};
use google_gmail1::Gmail;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use job_types::EmailMessage;
use std::path::Path;

const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Gmail caps `messages.list` pages at 500
const MAX_PAGE_SIZE: u32 = 500;

/// Client for interacting with Gmail API
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
    account_name: String,
}

impl GmailClient {
    /// Create a client for an account, reusing the OAuth token cached in its
    /// `token_file`. Without a cached token this starts the browser flow.
    pub async fn from_account(account: &AccountConfig) -> Result<Self> {
        let auth = authenticator(account).await?;

        let connector = google_gmail1::hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("Failed to load native TLS roots")?
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);
        let hub = Gmail::new(client, auth);

        Ok(Self {
            hub,
            account_name: account.name.clone(),
        })
    }

    /// Run the installed-app OAuth flow for an account and cache the token.
    pub async fn authorize(account: &AccountConfig) -> Result<()> {
        let auth = authenticator(account).await?;
        auth.token(&[GMAIL_READONLY_SCOPE])
            .await
            .context("Gmail authorization failed")?;
        Ok(())
    }

    /// List message ids matching a search query, following pages up to `max`
    async fn list_message_ids(&self, query: &str, max: u32) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < max as usize {
            let remaining = (max as usize - ids.len()).min(MAX_PAGE_SIZE as usize) as u32;
            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .q(query)
                .max_results(remaining)
                .add_scope(GMAIL_READONLY_SCOPE);
            if let Some(token) = &page_token {
                call = call.page_token(token);
            }

            let (_, response) = call.doit().await.context("Failed to list messages")?;

            ids.extend(
                response
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );

            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        ids.truncate(max as usize);
        Ok(ids)
    }

    /// Get full message details; `None` when Gmail returns it without an id
    pub async fn get_message(&self, message_id: &str) -> Result<Option<EmailMessage>> {
        let (_, message) = self
            .hub
            .users()
            .messages_get("me", message_id)
            .format("full")
            .add_scope(GMAIL_READONLY_SCOPE)
            .doit()
            .await
            .context("Failed to get message")?;

        Ok(parse_message(message, &self.account_name))
    }
}

#[async_trait]
impl EmailFetcher for GmailClient {
    async fn fetch_since(&self, since: DateTime<Utc>, max: u32) -> Result<Vec<EmailMessage>> {
        let query = format!("after:{}", since.timestamp());
        let ids = self.list_message_ids(&query, max).await?;

        let mut emails = Vec::new();
        for id in ids {
            match self.get_message(&id).await {
                Ok(Some(email)) => emails.push(email),
                Ok(None) => {
                    tracing::warn!("Skipping message {}: response carried no id", id);
                }
                Err(e) => {
                    tracing::warn!("Failed to fetch message {}: {}", id, e);
                }
            }
        }

        Ok(emails)
    }
}

async fn authenticator(account: &AccountConfig) -> Result<Authenticator<HttpsConnector<HttpConnector>>> {
    let credentials_file = account
        .credentials_file
        .as_deref()
        .context("Gmail account needs credentials_file")?;
    let token_file = account.require_token_file()?;
    ensure_parent_dir(token_file)?;

    let secret = google_gmail1::yup_oauth2::read_application_secret(credentials_file)
        .await
        .with_context(|| {
            format!(
                "Failed to read OAuth client secret {}. Create OAuth credentials \
                 (Desktop app) in the Google Cloud Console and download the JSON",
                credentials_file.display()
            )
        })?;

    InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
        .persist_tokens_to_disk(token_file)
        .build()
        .await
        .context("Failed to build Gmail authenticator")
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Messages without an id cannot be deduplicated and are dropped
fn parse_message(message: Message, account_name: &str) -> Option<EmailMessage> {
    let id = message.id.clone().filter(|id| !id.trim().is_empty())?;
    let snippet = message.snippet.clone().unwrap_or_default();

    let mut subject = String::new();
    let mut from = String::new();
    let mut received_at = None;

    if let Some(payload) = &message.payload {
        if let Some(headers) = &payload.headers {
            for header in headers {
                match header.name.as_deref() {
                    Some("Subject") => subject = header.value.clone().unwrap_or_default(),
                    Some("From") => from = header.value.clone().unwrap_or_default(),
                    Some("Date") => {
                        if let Some(date_str) = &header.value {
                            received_at = parse_date(date_str);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    // The Date header is sender-controlled; fall back to Gmail's receive time
    let received_at = received_at
        .or_else(|| message.internal_date.and_then(DateTime::from_timestamp_millis))
        .unwrap_or_else(Utc::now);

    let (body_text, body_html) = extract_bodies(&message);
    let body = body_text.or_else(|| body_html.map(|html| strip_html(&html)));
    let snippet = if snippet.is_empty() {
        body.as_deref().map(snippet_from).unwrap_or_default()
    } else {
        snippet
    };

    Some(EmailMessage {
        id,
        account_name: account_name.to_string(),
        subject,
        from,
        snippet,
        body,
        received_at,
    })
}

fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn extract_bodies(message: &Message) -> (Option<String>, Option<String>) {
    let payload = match message.payload.as_ref() {
        Some(p) => p,
        None => return (None, None),
    };

    let mut text_body = None;
    let mut html_body = None;

    if let Some(body) = &payload.body {
        if let Some(data) = &body.data {
            if let Some(decoded) = bytes_to_string(data) {
                match payload.mime_type.as_deref() {
                    Some("text/html") => html_body = Some(decoded),
                    _ => text_body = Some(decoded),
                }
            }
        }
    }

    if let Some(parts) = &payload.parts {
        extract_bodies_from_parts(parts, &mut text_body, &mut html_body);
    }

    (text_body, html_body)
}

fn extract_bodies_from_parts(
    parts: &[MessagePart],
    text_body: &mut Option<String>,
    html_body: &mut Option<String>,
) {
    for part in parts {
        match part.mime_type.as_deref() {
            Some("text/plain") if text_body.is_none() => {
                *text_body = part_data(part);
            }
            Some("text/html") if html_body.is_none() => {
                *html_body = part_data(part);
            }
            Some(mime) if mime.starts_with("multipart/") => {
                if let Some(nested_parts) = &part.parts {
                    extract_bodies_from_parts(nested_parts, text_body, html_body);
                }
            }
            _ => {}
        }
    }
}

fn part_data(part: &MessagePart) -> Option<String> {
    part.body
        .as_ref()
        .and_then(|body| body.data.as_deref())
        .and_then(bytes_to_string)
}

fn bytes_to_string(data: &[u8]) -> Option<String> {
    String::from_utf8(data.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePartBody, MessagePartHeader};

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn part(mime: &str, data: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.to_string()),
            body: Some(MessagePartBody {
                data: Some(data.as_bytes().to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn parses_headers_and_prefers_plain_text() {
        let message = Message {
            id: Some("18c2f".to_string()),
            snippet: Some("Thanks for applying".to_string()),
            payload: Some(MessagePart {
                mime_type: Some("multipart/alternative".to_string()),
                headers: Some(vec![
                    header("Subject", "Your application to Acme"),
                    header("From", "Acme Careers <jobs@acme.com>"),
                    header("Date", "Tue, 18 Nov 2025 14:30:00 +0000"),
                ]),
                parts: Some(vec![
                    part("text/plain", "Thanks for applying to Acme."),
                    part("text/html", "<p>Thanks for applying to <b>Acme</b>.</p>"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let email = parse_message(message, "Personal Gmail").unwrap();

        assert_eq!(email.id, "18c2f");
        assert_eq!(email.account_name, "Personal Gmail");
        assert_eq!(email.subject, "Your application to Acme");
        assert_eq!(email.from, "Acme Careers <jobs@acme.com>");
        assert_eq!(email.body.as_deref(), Some("Thanks for applying to Acme."));
        assert_eq!(email.received_at.to_rfc3339(), "2025-11-18T14:30:00+00:00");
    }

    #[test]
    fn falls_back_to_html_and_internal_date() {
        let message = Message {
            id: Some("abc".to_string()),
            internal_date: Some(1_763_476_200_000),
            payload: Some(MessagePart {
                mime_type: Some("multipart/mixed".to_string()),
                headers: Some(vec![header("Date", "not a date")]),
                parts: Some(vec![MessagePart {
                    mime_type: Some("multipart/alternative".to_string()),
                    parts: Some(vec![part("text/html", "<p>Interview <b>invite</b></p>")]),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let email = parse_message(message, "Gmail").unwrap();

        assert_eq!(email.body.as_deref(), Some("Interview invite"));
        assert_eq!(email.snippet, "Interview invite");
        assert_eq!(email.received_at.timestamp(), 1_763_476_200);
    }

    #[test]
    fn message_without_id_is_dropped() {
        let missing = Message {
            snippet: Some("Thanks for applying".to_string()),
            ..Default::default()
        };
        assert!(parse_message(missing, "Gmail").is_none());

        let blank = Message {
            id: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(parse_message(blank, "Gmail").is_none());
    }
}
