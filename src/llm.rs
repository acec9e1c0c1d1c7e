//! LLM provider abstraction for the incident classification lane
//!
//! Providers receive a batch of log lines and return a structured judgment.

mod anthropic;
mod error;
mod openai;
mod registry;
mod types;

pub use anthropic::AnthropicAnalyst;
pub use error::{LlmError, LlmErrorKind};
pub use openai::OpenAiAnalyst;
pub use registry::AnalystRegistry;
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for incident analysts
#[async_trait]
pub trait IncidentAnalyst: Send + Sync {
    /// Classify a batch of log events into a structured judgment
    async fn analyze(&self, request: &AnalysisRequest) -> Result<IncidentJudgment, LlmError>;

    /// Free-text completion, used for chat replies and refined
    /// remediation summaries
    async fn respond(&self, prompt: &str) -> Result<String, LlmError>;

    /// Provider label for logging and telemetry
    fn provider_id(&self) -> &str;
}

/// Logging wrapper for analysts
pub struct LoggingAnalyst {
    inner: Arc<dyn IncidentAnalyst>,
    provider_id: String,
}

impl LoggingAnalyst {
    pub fn new(inner: Arc<dyn IncidentAnalyst>) -> Self {
        let provider_id = inner.provider_id().to_string();
        Self { inner, provider_id }
    }
}

#[async_trait]
impl IncidentAnalyst for LoggingAnalyst {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<IncidentJudgment, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.analyze(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(judgment) => {
                tracing::info!(
                    provider = %self.provider_id,
                    service_id = %request.service_id,
                    duration_ms = %duration.as_millis(),
                    severity = %judgment.severity,
                    confidence = judgment.confidence,
                    "LLM analysis completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    provider = %self.provider_id,
                    service_id = %request.service_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "LLM analysis failed"
                );
            }
        }

        result
    }

    async fn respond(&self, prompt: &str) -> Result<String, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.respond(prompt).await;
        tracing::debug!(
            provider = %self.provider_id,
            duration_ms = %start.elapsed().as_millis(),
            ok = result.is_ok(),
            "LLM completion finished"
        );
        result
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}
