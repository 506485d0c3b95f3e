//! Email classification.
//!
//! The prompt asks the model for a small JSON object; everything around the
//! object (prose, code fences) is ignored when parsing the answer.

use crate::error::TrackerError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use job_types::{ApplicationCategory, Classification, EmailMessage};
use serde::Deserialize;

pub mod llm;

pub use llm::LlmClassifier;

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, email: &EmailMessage) -> Result<Classification>;
}

#[async_trait]
impl<C: Classifier + ?Sized> Classifier for Box<C> {
    async fn classify(&self, email: &EmailMessage) -> Result<Classification> {
        (**self).classify(email).await
    }
}

pub const SYSTEM_PROMPT: &str = "You are an assistant that tracks a candidate's job applications. \
You read one email at a time and answer only with a JSON object.";

/// Words that make an email worth sending to the model
const JOB_KEYWORDS: &[&str] = &[
    "application",
    "applied",
    "applying",
    "candidate",
    "candidacy",
    "position",
    "role",
    "interview",
    "recruit",
    "hiring",
    "talent",
    "career",
    "job",
    "jobs",
    "offer",
    "opportunity",
    "resume",
    "cv",
    "assessment",
    "screening",
    "unfortunately",
    "not moving forward",
    "next steps",
    "greenhouse",
    "lever.co",
    "workday",
    "ashby",
    "smartrecruiters",
];

/// Cheap keyword check on subject, sender and body
pub fn looks_job_related(email: &EmailMessage) -> bool {
    let content = format!(
        "{} {} {} {}",
        email.subject,
        email.from,
        email.snippet,
        email.body.as_deref().unwrap_or_default()
    )
    .to_lowercase();

    JOB_KEYWORDS.iter().any(|kw| contains_word(&content, kw))
}

/// Keyword match that does not fire inside longer words ("cv" in "cvs")
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        let boundary = |c: Option<char>| c.map_or(true, |c| !c.is_alphanumeric());
        // Prefix matches are fine: "recruit" covers "recruiter"
        boundary(before) && (boundary(after) || needle.len() >= 5)
    })
}

/// User prompt for one email, with the body cut to `max_body_chars`
pub fn build_prompt(email: &EmailMessage, max_body_chars: usize) -> String {
    let body = email.body.as_deref().unwrap_or(email.snippet.as_str());
    let body: String = body.chars().take(max_body_chars).collect();
    let categories = ApplicationCategory::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Classify the following email.\n\n\
         Answer with a JSON object with exactly these keys:\n\
         - \"category\": one of {categories}\n\
         - \"company\": the hiring company, or null\n\
         - \"position\": the job title, or null\n\
         - \"details\": one short sentence summarising the email\n\
         - \"interview_date\": the interview date and time as \"YYYY-MM-DD HH:MM\", or null\n\n\
         Use not_job_related for newsletters, job alerts and anything that is not about \
         an application the candidate made.\n\n\
         From: {from}\n\
         Subject: {subject}\n\
         Received: {received}\n\n\
         {body}",
        categories = categories,
        from = email.from,
        subject = email.subject,
        received = email.received_at.format("%Y-%m-%d %H:%M UTC"),
        body = body,
    )
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    category: String,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    position: Option<String>,
    #[serde(default, alias = "detail")]
    details: Option<String>,
    #[serde(default)]
    interview_date: Option<String>,
}

/// Parse a model answer into a [`Classification`].
pub fn parse_response(text: &str) -> Result<Classification> {
    let json = extract_json_object(text)
        .with_context(|| format!("No JSON object in classifier answer: {}", preview(text)))?;
    let raw: RawClassification =
        serde_json::from_str(json).context("Malformed classifier answer")?;

    let category: ApplicationCategory = raw
        .category
        .parse()
        .map_err(TrackerError::UnknownCategory)?;

    Ok(Classification {
        category,
        company: clean(raw.company),
        position: clean(raw.position),
        detail: clean(raw.details),
        interview_at: raw.interview_date.as_deref().and_then(parse_interview_date),
    })
}

/// Trimmed value; null-ish answers become empty
fn clean(value: Option<String>) -> String {
    let value = value.unwrap_or_default();
    let trimmed = value.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "null" | "none" | "n/a" | "unknown" => String::new(),
        _ => trimmed.to_string(),
    }
}

/// First balanced `{...}` in the text, skipping braces inside strings
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

fn parse_interview_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("null") {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    tracing::debug!("Ignoring unparseable interview date '{}'", value);
    None
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}
