//! Google Sheets backed store.
//!
//! Talks to the Sheets v4 REST API directly with `reqwest`; the access token
//! comes from a service account key through the `yup-oauth2` re-exported by
//! `google-gmail1`.

use super::ApplicationStore;
use crate::config::GoogleSheetsConfig;
use crate::error::{Result, TrackerError};
use anyhow::Context;
use async_trait::async_trait;
use google_gmail1::hyper_rustls::HttpsConnector;
use google_gmail1::yup_oauth2::{self, authenticator::Authenticator};
use hyper_util::client::legacy::connect::HttpConnector;
use job_types::JobApplicationRecord;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

type ServiceAccountAuth = Authenticator<HttpsConnector<HttpConnector>>;

/// Which failures a request may be re-sent after
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Reads and header writes: repeating them has no extra effect
    Idempotent,
    /// Appends: only when the server cannot have applied the request
    /// (429, or a connection that was never established)
    NotApplied,
}

/// Body of `values.get` / `values.append` / `values.update`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ValueRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(default)]
    pub values: Vec<Vec<String>>,
}

pub struct SheetsStore {
    client: Client,
    auth: ServiceAccountAuth,
    spreadsheet_id: String,
    sheet_name: String,
}

impl SheetsStore {
    /// Build a store from the `[google_sheets]` config section
    pub async fn connect(config: &GoogleSheetsConfig) -> anyhow::Result<Self> {
        let key = yup_oauth2::read_service_account_key(&config.credentials_file)
            .await
            .with_context(|| {
                format!(
                    "Failed to read service account key {}",
                    config.credentials_file.display()
                )
            })?;

        let auth = yup_oauth2::ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .context("Failed to build service account authenticator")?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            auth,
            spreadsheet_id: config.spreadsheet_id.clone(),
            sheet_name: config.sheet_name.clone(),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let token = self
            .auth
            .token(&[SHEETS_SCOPE])
            .await
            .map_err(|e| TrackerError::store_unavailable(format!("Sheets auth failed: {}", e)))?;

        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| TrackerError::store_unavailable("Sheets auth returned no access token"))
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/{}/values/{}",
            SHEETS_API,
            self.spreadsheet_id,
            urlencoding::encode(range)
        )
    }

    async fn get_values(&self, range: &str) -> Result<ValueRange> {
        let token = self.access_token().await?;
        let url = self.values_url(range);

        let response =
            send_with_retry(Retry::Idempotent, || self.client.get(&url).bearer_auth(&token))
                .await?;
        response
            .json::<ValueRange>()
            .await
            .map_err(|e| TrackerError::store_unavailable(format!("Invalid Sheets response: {}", e)))
    }
}

#[async_trait]
impl ApplicationStore for SheetsStore {
    async fn list_known_ids(&self) -> Result<HashSet<String>> {
        let values = self.get_values(&id_column_range(&self.sheet_name)).await?;
        let ids = known_ids_from(values);
        tracing::debug!("Loaded {} known ids from sheet '{}'", ids.len(), self.sheet_name);
        Ok(ids)
    }

    async fn append_row(&self, record: &JobApplicationRecord) -> Result<()> {
        let token = self.access_token().await?;
        let url = format!(
            "{}:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.values_url(&table_range(&self.sheet_name))
        );
        let body = ValueRange {
            range: None,
            values: vec![record.to_row()],
        };

        send_with_retry(Retry::NotApplied, || {
            self.client.post(&url).bearer_auth(&token).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn prepare(&self) -> Result<()> {
        let range = header_range(&self.sheet_name);
        let existing = self.get_values(&range).await?;
        if existing.values.iter().any(|row| !row.is_empty()) {
            return Ok(());
        }

        tracing::info!("Writing header row to sheet '{}'", self.sheet_name);
        let token = self.access_token().await?;
        let url = format!("{}?valueInputOption=RAW", self.values_url(&range));
        let body = ValueRange {
            range: None,
            values: vec![JobApplicationRecord::HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect()],
        };

        send_with_retry(Retry::Idempotent, || {
            self.client.put(&url).bearer_auth(&token).json(&body)
        })
        .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "Google Sheet {} (tab '{}')",
            self.spreadsheet_id, self.sheet_name
        )
    }
}

/// A1 notation needs the sheet name quoted, with embedded quotes doubled.
fn quoted_sheet(sheet_name: &str) -> String {
    format!("'{}'", sheet_name.replace('\'', "''"))
}

fn id_column_range(sheet_name: &str) -> String {
    format!("{}!A2:A", quoted_sheet(sheet_name))
}

fn header_range(sheet_name: &str) -> String {
    format!("{}!A1:H1", quoted_sheet(sheet_name))
}

fn table_range(sheet_name: &str) -> String {
    format!("{}!A:H", quoted_sheet(sheet_name))
}

fn known_ids_from(values: ValueRange) -> HashSet<String> {
    values
        .values
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .map(|cell| cell.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

fn is_transient(status: StatusCode, retry: Retry) -> bool {
    match retry {
        Retry::Idempotent => status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
        Retry::NotApplied => status == StatusCode::TOO_MANY_REQUESTS,
    }
}

fn is_transient_error(e: &reqwest::Error, retry: Retry) -> bool {
    match retry {
        Retry::Idempotent => e.is_connect() || e.is_timeout(),
        Retry::NotApplied => e.is_connect(),
    }
}

/// Send a request, retrying what `retry` allows with exponential backoff.
/// Anything left over is `StoreUnavailable`.
async fn send_with_retry<F>(retry: Retry, build: F) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 1;
    let mut delay = INITIAL_BACKOFF;

    loop {
        let failure = match build().send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let message = format!("Sheets API returned {}: {}", status, truncate(&body, 200));
                if !is_transient(status, retry) {
                    return Err(TrackerError::store_unavailable(message));
                }
                message
            }
            Err(e) if is_transient_error(&e, retry) => format!("Sheets request failed: {}", e),
            Err(e) => {
                return Err(TrackerError::store_unavailable(format!(
                    "Sheets request failed: {}",
                    e
                )))
            }
        };

        if attempt >= MAX_ATTEMPTS {
            return Err(TrackerError::store_unavailable(failure));
        }

        tracing::warn!(
            "{} (attempt {}/{}), retrying in {:?}",
            failure,
            attempt,
            MAX_ATTEMPTS,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
        delay *= 2;
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
