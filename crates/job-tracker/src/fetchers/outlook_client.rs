//! Microsoft Graph client for Outlook / Microsoft 365 mailboxes.
//!
//! Tokens live in the account's `token_file`. The first refresh token is
//! obtained with the OAuth2 device authorization grant (RFC 8628); after that
//! access tokens are refreshed silently and rotated refresh tokens written
//! back to the file.

use super::{snippet_from, strip_html, EmailFetcher};
use crate::config::AccountConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use job_types::EmailMessage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const GRAPH_MESSAGES_URL: &str = "https://graph.microsoft.com/v1.0/me/messages";
const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const SCOPES: &str = "https://graph.microsoft.com/Mail.Read offline_access";

/// Graph allows up to 1000 per page, but large pages with bodies are slow
const PAGE_SIZE: u32 = 50;

/// Refresh a little before the token actually expires
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Keeps OAuth error bodies out of logs beyond a short prefix
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Token file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredToken {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "No Outlook token at {}. Run `job-tracker auth <account>` first",
                path.display()
            )
        })?;
        serde_json::from_str(&content).context("Failed to parse Outlook token file")
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Cached access token if it is still valid at `now`
    fn fresh_access_token(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.access_token, self.expires_at) {
            (Some(token), Some(expires_at))
                if expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS) > now =>
            {
                Some(token)
            }
            _ => None,
        }
    }

    fn from_response(response: TokenResponse, previous_refresh: Option<&str>) -> Result<Self> {
        let refresh_token = response
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))
            .context("Token response did not include a refresh token (is offline_access granted?)")?;

        Ok(StoredToken {
            refresh_token,
            expires_at: response
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64)),
            access_token: Some(response.access_token),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
    #[serde(default)]
    message: Option<String>,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct GraphMessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    #[serde(default)]
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    body_preview: Option<String>,
    #[serde(default)]
    body: Option<GraphItemBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphItemBody {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

pub struct OutlookClient {
    http: Client,
    account_name: String,
    client_id: String,
    tenant_id: String,
    token_file: PathBuf,
}

impl OutlookClient {
    pub fn from_account(account: &AccountConfig) -> Result<Self> {
        let client_id = account
            .client_id
            .clone()
            .context("Outlook account needs client_id")?;

        Ok(Self {
            http: create_http_client()?,
            account_name: account.name.clone(),
            client_id,
            tenant_id: account.tenant_id.clone(),
            token_file: account.require_token_file()?.to_path_buf(),
        })
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", LOGIN_BASE, self.tenant_id)
    }

    fn device_code_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/devicecode", LOGIN_BASE, self.tenant_id)
    }

    /// Interactive device-code sign in; stores the resulting tokens.
    pub async fn authorize(&self) -> Result<()> {
        let response = self
            .http
            .post(self.device_code_url())
            .form(&[("client_id", self.client_id.as_str()), ("scope", SCOPES)])
            .send()
            .await
            .context("Device code request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Device code request returned {}: {}",
                status,
                sanitize_error_body(&body)
            );
        }

        let device: DeviceCodeResponse = response
            .json()
            .await
            .context("Invalid device code response")?;

        println!();
        match &device.message {
            Some(message) => println!("{}", message),
            None => println!(
                "To sign in, open {} and enter the code {}",
                device.verification_uri, device.user_code
            ),
        }
        println!();

        let mut interval = Duration::from_secs(device.interval.max(1));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in.max(5));

        loop {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("Device code expired before sign in completed");
            }
            tokio::time::sleep(interval).await;

            let response = self
                .http
                .post(self.token_url())
                .form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", device.device_code.as_str()),
                ])
                .send()
                .await
                .context("Token polling request failed")?;

            if response.status().is_success() {
                let token: TokenResponse = response.json().await?;
                StoredToken::from_response(token, None)?.save(&self.token_file)?;
                tracing::info!("Saved Outlook token to {}", self.token_file.display());
                return Ok(());
            }

            let body = response.text().await.unwrap_or_default();
            let error: TokenErrorResponse = serde_json::from_str(&body)
                .with_context(|| format!("Unexpected token response: {}", sanitize_error_body(&body)))?;

            match error.error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => interval += Duration::from_secs(5),
                other => anyhow::bail!(
                    "Outlook sign in failed ({}): {}",
                    other,
                    error.error_description.unwrap_or_default()
                ),
            }
        }
    }

    /// Valid access token, refreshing (and persisting) when needed
    async fn access_token(&self) -> Result<String> {
        let stored = StoredToken::load(&self.token_file)?;
        if let Some(token) = stored.fresh_access_token(Utc::now()) {
            return Ok(token.to_string());
        }

        tracing::debug!("Refreshing Outlook access token for {}", self.account_name);
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", stored.refresh_token.as_str()),
                ("scope", SCOPES),
            ])
            .send()
            .await
            .context("Token refresh request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Outlook token refresh returned {}: {}. Run `job-tracker auth {}` again",
                status,
                sanitize_error_body(&body),
                self.account_name
            );
        }

        let token: TokenResponse = response.json().await.context("Invalid token response")?;
        let refreshed = StoredToken::from_response(token, Some(&stored.refresh_token))?;
        refreshed.save(&self.token_file)?;

        refreshed
            .access_token
            .context("Token response without access token")
    }
}

#[async_trait]
impl EmailFetcher for OutlookClient {
    async fn fetch_since(&self, since: DateTime<Utc>, max: u32) -> Result<Vec<EmailMessage>> {
        let token = self.access_token().await?;
        let filter = format!(
            "receivedDateTime ge {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let top = PAGE_SIZE.min(max.max(1)).to_string();

        let mut request = self.http.get(GRAPH_MESSAGES_URL).query(&[
            ("$filter", filter.as_str()),
            ("$orderby", "receivedDateTime desc"),
            ("$top", top.as_str()),
            ("$select", "id,subject,from,receivedDateTime,bodyPreview,body"),
        ]);

        let mut emails = Vec::new();
        loop {
            let response = request
                .bearer_auth(&token)
                .header("Prefer", "outlook.body-content-type=\"text\"")
                .send()
                .await
                .context("Failed to list Outlook messages")?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!(
                    "Graph API returned {}: {}",
                    status,
                    sanitize_error_body(&body)
                );
            }

            let page: GraphMessagePage = response
                .json()
                .await
                .context("Invalid Graph messages response")?;

            for message in page.value {
                if emails.len() >= max as usize {
                    break;
                }
                emails.push(to_email_message(message, &self.account_name));
            }

            match page.next_link {
                Some(next) if emails.len() < max as usize => request = self.http.get(next),
                _ => break,
            }
        }

        Ok(emails)
    }
}

fn to_email_message(message: GraphMessage, account_name: &str) -> EmailMessage {
    let from = message
        .from
        .map(|r| match (r.email_address.name, r.email_address.address) {
            (Some(name), Some(address)) if !name.is_empty() => format!("{} <{}>", name, address),
            (_, Some(address)) => address,
            (Some(name), None) => name,
            (None, None) => String::new(),
        })
        .unwrap_or_default();

    let body = message.body.and_then(|b| {
        let content = b.content?;
        if b.content_type.as_deref() == Some("html") {
            Some(strip_html(&content))
        } else {
            Some(content)
        }
    });

    let snippet = message
        .body_preview
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| body.as_deref().map(snippet_from).unwrap_or_default());

    EmailMessage {
        id: message.id,
        account_name: account_name.to_string(),
        subject: message.subject.unwrap_or_default(),
        from,
        snippet,
        body,
        received_at: message.received_date_time.unwrap_or_else(Utc::now),
    }
}

fn create_http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")
}

fn sanitize_error_body(body: &str) -> String {
    if body.chars().count() > MAX_ERROR_BODY_LENGTH {
        format!(
            "{}... (truncated)",
            body.chars().take(MAX_ERROR_BODY_LENGTH).collect::<String>()
        )
    } else {
        body.to_string()
    }
}
