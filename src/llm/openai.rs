//! OpenAI analyst implementation

use super::types::{build_prompt, parse_judgment, AnalysisRequest, IncidentJudgment};
use super::{IncidentAnalyst, LlmError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI analyst
pub struct OpenAiAnalyst {
    client: Client,
    api_key: String,
}

impl OpenAiAnalyst {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, api_key })
    }

    async fn complete_text(&self, prompt: &str, json_mode: bool) -> Result<String, LlmError> {
        let body = OpenAiRequest {
            model: MODEL.to_string(),
            messages: vec![OpenAiMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.0,
            response_format: json_mode.then(|| ResponseFormat {
                r#type: "json_object".to_string(),
            }),
        };

        let response = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("OpenAI request timed out: {e}"))
                } else {
                    LlmError::network(format!("OpenAI request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::auth(format!("OpenAI auth failed: {text}")),
                429 => LlmError::rate_limit("OpenAI rate limited")
                    .with_retry_after(Duration::from_secs(5)),
                400 => LlmError::invalid_request(format!("OpenAI rejected request: {text}")),
                s if s >= 500 => LlmError::server_error(format!("OpenAI {s}: {text}")),
                s => LlmError::new(
                    super::LlmErrorKind::Unavailable,
                    format!("OpenAI unexpected status {s}: {text}"),
                ),
            });
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::parse(format!("OpenAI response did not parse: {e}")))?;

        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(LlmError::parse("OpenAI returned empty content"));
        }

        Ok(text)
    }
}

#[async_trait]
impl IncidentAnalyst for OpenAiAnalyst {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<IncidentJudgment, LlmError> {
        let text = self.complete_text(&build_prompt(request), true).await?;
        parse_judgment(&text)
    }

    async fn respond(&self, prompt: &str) -> Result<String, LlmError> {
        self.complete_text(prompt, false).await
    }

    fn provider_id(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: String,
}
