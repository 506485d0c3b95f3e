//! Chat-completion backends for the classifier.

use super::{build_prompt, looks_job_related, parse_response, Classifier, SYSTEM_PROMPT};
use crate::config::{LlmConfig, LlmProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use job_types::{Classification, EmailMessage};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 512;
const MAX_ATTEMPTS: u32 = 3;

pub struct LlmClassifier {
    http: Client,
    config: LlmConfig,
    api_key: Option<String>,
    retry_backoff: Duration,
}

impl LlmClassifier {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let api_key = config.resolved_api_key();
        if api_key.is_none() && config.provider != LlmProvider::Ollama {
            anyhow::bail!(
                "No API key for {}. Set llm.api_key or the {} environment variable",
                config.provider.as_str(),
                config.provider.api_key_env().unwrap_or("provider's API key")
            );
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            config,
            api_key,
            retry_backoff: Duration::from_secs(2),
        })
    }

    pub fn describe(&self) -> String {
        format!("{} ({})", self.config.provider.as_str(), self.config.model())
    }

    fn api_key(&self) -> &str {
        self.api_key.as_deref().unwrap_or_default()
    }

    /// Raw text answer for a prompt
    async fn complete(&self, prompt: &str) -> Result<String> {
        let base = self.config.base_url();
        let model = self.config.model();

        let request = match self.config.provider {
            LlmProvider::Anthropic => self
                .http
                .post(format!("{}/v1/messages", base))
                .header("x-api-key", self.api_key())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&serde_json::json!({
                    "model": model,
                    "max_tokens": MAX_OUTPUT_TOKENS,
                    "temperature": 0,
                    "system": SYSTEM_PROMPT,
                    "messages": [{ "role": "user", "content": prompt }]
                })),
            LlmProvider::OpenAi => self
                .http
                .post(format!("{}/v1/chat/completions", base))
                .bearer_auth(self.api_key())
                .json(&serde_json::json!({
                    "model": model,
                    "temperature": 0,
                    "response_format": { "type": "json_object" },
                    "messages": [
                        { "role": "system", "content": SYSTEM_PROMPT },
                        { "role": "user", "content": prompt }
                    ]
                })),
            LlmProvider::Google => self
                .http
                .post(format!("{}/v1beta/models/{}:generateContent", base, model))
                .header("x-goog-api-key", self.api_key())
                .json(&serde_json::json!({
                    "systemInstruction": { "parts": [{ "text": SYSTEM_PROMPT }] },
                    "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
                    "generationConfig": {
                        "temperature": 0,
                        "responseMimeType": "application/json"
                    }
                })),
            LlmProvider::Ollama => self
                .http
                .post(format!("{}/api/chat", base))
                .json(&serde_json::json!({
                    "model": model,
                    "stream": false,
                    "format": "json",
                    "options": { "temperature": 0 },
                    "messages": [
                        { "role": "system", "content": SYSTEM_PROMPT },
                        { "role": "user", "content": prompt }
                    ]
                })),
        };

        let provider = self.config.provider.as_str();
        let mut attempt = 1;
        let mut delay = self.retry_backoff;

        loop {
            let attempt_request = request
                .try_clone()
                .context("LLM request body cannot be replayed")?;

            let failure = match attempt_request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if status.is_success() {
                        return extract_text(self.config.provider, &body);
                    }
                    let message = format!(
                        "{} returned {}: {}",
                        provider,
                        status,
                        body.chars().take(300).collect::<String>()
                    );
                    if !is_retryable(status) {
                        anyhow::bail!(message);
                    }
                    message
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    format!("{} request failed: {}", provider, e)
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("{} request failed", provider));
                }
            };

            if attempt >= MAX_ATTEMPTS {
                anyhow::bail!(failure);
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
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, email: &EmailMessage) -> Result<Classification> {
        if self.config.prefilter && !looks_job_related(email) {
            tracing::trace!("Prefilter: no job keywords in {}", email.id);
            return Ok(Classification::not_job_related("No job-related keywords"));
        }

        let prompt = build_prompt(email, self.config.max_body_chars);
        let answer = self.complete(&prompt).await?;
        parse_response(&answer)
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: ChatMessage,
}

/// Rate limits and overload (429, 5xx, Anthropic's 529)
fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Pull the answer text out of a provider response body
fn extract_text(provider: LlmProvider, body: &str) -> Result<String> {
    let text = match provider {
        LlmProvider::Anthropic => serde_json::from_str::<AnthropicResponse>(body)
            .context("Failed to parse Anthropic response")?
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join(""),
        LlmProvider::OpenAi => serde_json::from_str::<OpenAiResponse>(body)
            .context("Failed to parse OpenAI response")?
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default(),
        LlmProvider::Google => serde_json::from_str::<GeminiResponse>(body)
            .context("Failed to parse Gemini response")?
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default(),
        LlmProvider::Ollama => serde_json::from_str::<OllamaResponse>(body)
            .context("Failed to parse Ollama response")?
            .message
            .content
            .unwrap_or_default(),
    };

    if text.trim().is_empty() {
        anyhow::bail!("{} returned an empty answer", provider.as_str());
    }
    Ok(text)
}
