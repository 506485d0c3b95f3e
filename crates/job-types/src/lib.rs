use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Application Category
// ============================================================================

/// Classification assigned to an email by the LLM.
///
/// Serialized as the lower snake-case name. Parsing is case-insensitive so the
/// upper-case spelling some models answer with is accepted too; anything else
/// is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ApplicationCategory {
    NewApplication,
    Update,
    Interview,
    Rejection,
    Offer,
    NotJobRelated,
}

/// Returned when a category string is outside the fixed enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown application category: {0:?}")]
pub struct UnknownCategory(pub String);

impl ApplicationCategory {
    pub const ALL: [ApplicationCategory; 6] = [
        ApplicationCategory::NewApplication,
        ApplicationCategory::Update,
        ApplicationCategory::Interview,
        ApplicationCategory::Rejection,
        ApplicationCategory::Offer,
        ApplicationCategory::NotJobRelated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationCategory::NewApplication => "new_application",
            ApplicationCategory::Update => "update",
            ApplicationCategory::Interview => "interview",
            ApplicationCategory::Rejection => "rejection",
            ApplicationCategory::Offer => "offer",
            ApplicationCategory::NotJobRelated => "not_job_related",
        }
    }

    /// Human readable label written to the spreadsheet.
    pub fn label(&self) -> &'static str {
        match self {
            ApplicationCategory::NewApplication => "New Application",
            ApplicationCategory::Update => "Update",
            ApplicationCategory::Interview => "Interview",
            ApplicationCategory::Rejection => "Rejection",
            ApplicationCategory::Offer => "Offer",
            ApplicationCategory::NotJobRelated => "Not Job Related",
        }
    }

    pub fn is_job_related(&self) -> bool {
        !matches!(self, ApplicationCategory::NotJobRelated)
    }
}

impl FromStr for ApplicationCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "new_application" => Ok(ApplicationCategory::NewApplication),
            "update" => Ok(ApplicationCategory::Update),
            "interview" => Ok(ApplicationCategory::Interview),
            "rejection" => Ok(ApplicationCategory::Rejection),
            "offer" => Ok(ApplicationCategory::Offer),
            "not_job_related" => Ok(ApplicationCategory::NotJobRelated),
            _ => Err(UnknownCategory(s.to_string())),
        }
    }
}

impl TryFrom<String> for ApplicationCategory {
    type Error = UnknownCategory;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ApplicationCategory> for String {
    fn from(category: ApplicationCategory) -> Self {
        category.as_str().to_string()
    }
}

impl fmt::Display for ApplicationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Email Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    Gmail,
    Outlook,
    Imap,
}

impl EmailProvider {
    pub fn as_str(&self) -> &str {
        match self {
            EmailProvider::Gmail => "gmail",
            EmailProvider::Outlook => "outlook",
            EmailProvider::Imap => "imap",
        }
    }
}

/// Provider-neutral email fetched from one of the configured accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Provider-assigned identifier, unique within the originating account
    pub id: String,
    pub account_name: String,
    pub subject: String,
    pub from: String,
    pub snippet: String,
    pub body: Option<String>,
    pub received_at: DateTime<Utc>,
}

// ============================================================================
// Job Application Records
// ============================================================================

/// Structured verdict extracted from one email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ApplicationCategory,
    pub company: String,
    pub position: String,
    pub detail: String,
    pub interview_at: Option<DateTime<Utc>>,
}

impl Classification {
    pub fn not_job_related(reason: impl Into<String>) -> Self {
        Classification {
            category: ApplicationCategory::NotJobRelated,
            company: String::new(),
            position: String::new(),
            detail: reason.into(),
            interview_at: None,
        }
    }
}

/// One row of the job application sheet.
///
/// `source_email_id` is the natural key: the store never holds two rows with
/// the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobApplicationRecord {
    pub source_email_id: String,
    pub account_name: String,
    pub observed_at: DateTime<Utc>,
    pub company: String,
    pub position: String,
    pub category: ApplicationCategory,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interview_at: Option<DateTime<Utc>>,
}

impl JobApplicationRecord {
    pub fn from_classification(email: &EmailMessage, classification: Classification) -> Self {
        JobApplicationRecord {
            source_email_id: email.id.clone(),
            account_name: email.account_name.clone(),
            observed_at: email.received_at,
            company: classification.company,
            position: classification.position,
            category: classification.category,
            detail: classification.detail,
            interview_at: classification.interview_at,
        }
    }

    /// Column headers matching the order of [`JobApplicationRecord::to_row`]
    pub const HEADERS: [&'static str; 8] = [
        "Email ID",
        "Account",
        "Date",
        "Company",
        "Position",
        "Status",
        "Details",
        "Interview Date",
    ];

    /// Render as spreadsheet cells; the natural key is always the first column.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.source_email_id.clone(),
            self.account_name.clone(),
            self.observed_at.format("%Y-%m-%d %H:%M").to_string(),
            display_or_unknown(&self.company),
            display_or_unknown(&self.position),
            self.category.label().to_string(),
            self.detail.clone(),
            self.interview_at
                .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default(),
        ]
    }
}

fn display_or_unknown(value: &str) -> String {
    if value.trim().is_empty() {
        "Unknown".to_string()
    } else {
        value.to_string()
    }
}
