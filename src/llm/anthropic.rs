//! Anthropic Claude analyst implementation

use super::types::{build_prompt, parse_judgment, AnalysisRequest, IncidentJudgment};
use super::{IncidentAnalyst, LlmError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const MODEL: &str = "claude-sonnet-4-20250514";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Anthropic analyst
pub struct AnthropicAnalyst {
    client: Client,
    api_key: String,
}

impl AnthropicAnalyst {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, api_key })
    }

    async fn complete_text(&self, prompt: &str) -> Result<String, LlmError> {
        let body = AnthropicRequest {
            model: MODEL.to_string(),
            max_tokens: 1024,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Anthropic request timed out: {e}"))
                } else {
                    LlmError::network(format!("Anthropic request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::auth(format!("Anthropic auth failed: {text}")),
                429 => LlmError::rate_limit("Anthropic rate limited")
                    .with_retry_after(Duration::from_secs(5)),
                400 => LlmError::invalid_request(format!("Anthropic rejected request: {text}")),
                s if s >= 500 => LlmError::server_error(format!("Anthropic {s}: {text}")),
                s => LlmError::new(
                    super::LlmErrorKind::Unavailable,
                    format!("Anthropic unexpected status {s}: {text}"),
                ),
            });
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::parse(format!("Anthropic response did not parse: {e}")))?;

        let text = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.as_str()),
            })
            .collect::<Vec<_>>()
            .join("\n");

        if text.is_empty() {
            return Err(LlmError::parse("Anthropic returned empty content"));
        }

        Ok(text)
    }
}

#[async_trait]
impl IncidentAnalyst for AnthropicAnalyst {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<IncidentJudgment, LlmError> {
        let text = self.complete_text(&build_prompt(request)).await?;
        parse_judgment(&text)
    }

    async fn respond(&self, prompt: &str) -> Result<String, LlmError> {
        self.complete_text(prompt).await
    }

    fn provider_id(&self) -> &str {
        "anthropic"
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
}
