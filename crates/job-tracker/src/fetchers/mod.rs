//! Email fetchers, one per provider.
//!
//! Each fetcher returns the messages received since a given instant as
//! provider-neutral [`EmailMessage`]s.

use crate::config::AccountConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use job_types::{EmailMessage, EmailProvider};
use regex::Regex;
use std::sync::LazyLock;

pub mod gmail_client;
pub mod imap_client;
pub mod outlook_client;

pub use gmail_client::GmailClient;
pub use imap_client::ImapFetcher;
pub use outlook_client::OutlookClient;

#[async_trait]
pub trait EmailFetcher: Send + Sync {
    /// Messages received at or after `since`, at most `max` of them.
    async fn fetch_since(&self, since: DateTime<Utc>, max: u32) -> Result<Vec<EmailMessage>>;
}

/// Build the fetcher for an account's provider.
pub async fn connect(account: &AccountConfig) -> Result<Box<dyn EmailFetcher>> {
    let fetcher: Box<dyn EmailFetcher> = match account.provider {
        EmailProvider::Gmail => Box::new(GmailClient::from_account(account).await?),
        EmailProvider::Outlook => Box::new(OutlookClient::from_account(account)?),
        EmailProvider::Imap => Box::new(ImapFetcher::from_account(account)?),
    };
    Ok(fetcher)
}

/// First 200 characters of the body on a single line
pub(crate) fn snippet_from(body: &str) -> String {
    body.chars()
        .take(200)
        .collect::<String>()
        .replace('\n', " ")
        .replace('\r', "")
        .trim()
        .to_string()
}

static RE_HIDDEN_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(style|script|head)\b[^>]*>.*?</(style|script|head)>").unwrap()
});
static RE_TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Rough HTML to text for mails without a plain-text part
pub(crate) fn strip_html(html: &str) -> String {
    let text = RE_HIDDEN_BLOCKS.replace_all(html, " ");
    let text = RE_TAGS.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    RE_WHITESPACE.replace_all(&text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_keeps_visible_text() {
        let html = "<html><head><title>x</title></head><body>\
                    <style>p { color: red; }</style>\
                    <p>Dear&nbsp;candidate,</p><p>We&#39;d like to <b>talk</b> &amp; meet.</p>\
                    </body></html>";
        assert_eq!(strip_html(html), "Dear candidate, We'd like to talk & meet.");
    }

    #[test]
    fn snippet_is_single_line_and_bounded() {
        let body = format!("Hello\r\nthere\n{}", "x".repeat(500));
        let snippet = snippet_from(&body);
        assert!(!snippet.contains('\n'));
        assert!(!snippet.contains('\r'));
        assert!(snippet.starts_with("Hello there"));
        assert!(snippet.chars().count() <= 200);
    }
}
