//! Remote text condensation for announcement bodies.
//!
//! Entirely optional: without an API key the scheduler never constructs a
//! [`Summarizer`] and the formatter falls back to a truncated body excerpt.
//! Failures here degrade the announcement, they never fail the poll.
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const MESSAGES_PATH: &str = "/v1/messages";
const CLAUDE_MODEL: &str = "claude-3-5-haiku-20241022";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SummarizerError {
    /// Call did not complete within the configured timeout
    #[error("Summarizer request timed out")]
    Timeout,
    /// Network-level error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    /// Non-2xx API response
    #[error("API error: {0}")]
    Api(String),
    /// Response carried no usable text
    #[error("Empty summary returned")]
    Empty,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    text: Option<String>,
}

// ============================================================================
// Summarizer
// ============================================================================

pub struct Summarizer {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    timeout: Duration,
    max_input_bytes: usize,
}

impl Summarizer {
    /// Build from configuration. `None` when no API key is set, which
    /// disables summarization for the whole process.
    pub fn from_config(config: &crate::config::SummarizerConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_input_bytes: config.max_input_bytes,
        })
    }

    /// Point the client at a different API host. Test seam for wiremock.
    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Condense one entry body into a short announcement summary.
    ///
    /// The whole call, request and body read included, runs under the
    /// configured timeout.
    pub async fn summarize(&self, title: &str, body: &str) -> Result<String, SummarizerError> {
        let input = truncate_to_boundary(body, self.max_input_bytes);

        let user_message = format!(
            "Condense the feed entry below into at most two short sentences \
             suitable for a single IRC announcement. Use only information from \
             the entry. Reply with the sentences only.\n\nTitle: {}\n\n{}",
            title, input
        );

        let request = MessageRequest {
            model: CLAUDE_MODEL.to_string(),
            max_tokens: 256,
            messages: vec![Message {
                role: "user".to_string(),
                content: user_message,
            }],
        };

        tokio::time::timeout(self.timeout, self.call(&request))
            .await
            .map_err(|_| SummarizerError::Timeout)?
    }

    async fn call(&self, request: &MessageRequest) -> Result<String, SummarizerError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, MESSAGES_PATH))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(SummarizerError::Api(format!(
                "status {}: {}",
                status, error_text
            )));
        }

        let message_response: MessageResponse = response.json().await?;

        let summary = message_response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        if summary.is_empty() {
            return Err(SummarizerError::Empty);
        }
        Ok(summary)
    }
}

/// Cut `text` to at most `limit` bytes without splitting a UTF-8 character.
fn truncate_to_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ============================================================================
// Tests
// ============================================================================
