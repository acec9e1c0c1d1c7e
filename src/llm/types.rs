//! Request/response types shared by the analyst providers

use super::LlmError;
use crate::db::{RecommendedAction, Severity};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One log line offered to the analyst
#[derive(Debug, Clone)]
pub struct LogSample {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// A batched classification request for one service
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub service_id: String,
    pub service_name: String,
    pub samples: Vec<LogSample>,
    /// What the pattern lane already concluded, if anything
    pub pattern_hint: Option<String>,
}

/// Structured judgment returned by a provider
#[derive(Debug, Clone)]
pub struct IncidentJudgment {
    pub severity: Severity,
    pub root_cause: String,
    pub recommended_action: RecommendedAction,
    pub confidence: f64,
    pub reasoning: String,
}

/// Raw wire shape before validation
#[derive(Debug, Deserialize)]
struct RawJudgment {
    severity: String,
    root_cause: String,
    recommended_action: String,
    confidence: f64,
    reasoning: String,
}

/// Build the shared classification prompt. Providers differ only in
/// transport, not in the contract.
pub fn build_prompt(request: &AnalysisRequest) -> String {
    let mut prompt = String::with_capacity(2048);
    prompt.push_str(
        "You are a production incident classifier. Analyze the log lines below \
         and respond with a single JSON object, no prose, no code fences:\n\
         {\"severity\": \"critical|high|medium|low\", \
          \"root_cause\": \"<one sentence>\", \
          \"recommended_action\": \"restart|redeploy|scale_memory|scale_replicas|rollback|stop|manual_fix|none\", \
          \"confidence\": <0.0-1.0>, \
          \"reasoning\": \"<one or two sentences>\"}\n\n",
    );
    prompt.push_str(&format!(
        "Service: {} ({})\n",
        request.service_name, request.service_id
    ));
    if let Some(hint) = &request.pattern_hint {
        prompt.push_str(&format!("Pattern pre-screen: {hint}\n"));
    }
    prompt.push_str("Log lines (newest last):\n");
    for sample in &request.samples {
        prompt.push_str(&format!(
            "{} [{}] {}\n",
            sample.timestamp.to_rfc3339(),
            sample.level,
            sample.message
        ));
    }
    prompt
}

/// Parse a provider's text response into a validated judgment.
///
/// Tolerates fenced output and leading/trailing prose by extracting the
/// first balanced JSON object.
pub fn parse_judgment(text: &str) -> Result<IncidentJudgment, LlmError> {
    let json = extract_json_object(text)
        .ok_or_else(|| LlmError::parse("response contains no JSON object"))?;
    let raw: RawJudgment = serde_json::from_str(json)
        .map_err(|e| LlmError::parse(format!("judgment JSON did not parse: {e}")))?;

    let severity = Severity::parse(raw.severity.trim())
        .ok_or_else(|| LlmError::parse(format!("unknown severity {:?}", raw.severity)))?;
    let recommended_action = RecommendedAction::parse(raw.recommended_action.trim())
        .ok_or_else(|| {
            LlmError::parse(format!(
                "unknown recommended_action {:?}",
                raw.recommended_action
            ))
        })?;
    if !raw.confidence.is_finite() {
        return Err(LlmError::parse("confidence is not finite"));
    }

    Ok(IncidentJudgment {
        severity,
        root_cause: raw.root_cause,
        recommended_action,
        confidence: raw.confidence.clamp(0.0, 1.0),
        reasoning: raw.reasoning,
    })
}

/// Extract the first balanced `{...}` region, ignoring braces inside strings.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return text.get(start..=start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_judgment() {
        let text = r#"{"severity": "critical", "root_cause": "OOM kill", "recommended_action": "scale_memory", "confidence": 0.92, "reasoning": "repeated oom killer lines"}"#;
        let judgment = parse_judgment(text).unwrap();
        assert_eq!(judgment.severity, Severity::Critical);
        assert_eq!(judgment.recommended_action, RecommendedAction::ScaleMemory);
        assert!((judgment.confidence - 0.92).abs() < 1e-9);
    }

    #[test]
    fn test_parse_fenced_judgment() {
        let text = "Here is the analysis:\n```json\n{\"severity\": \"high\", \"root_cause\": \"conn refused\", \"recommended_action\": \"restart\", \"confidence\": 0.7, \"reasoning\": \"x\"}\n```";
        let judgment = parse_judgment(text).unwrap();
        assert_eq!(judgment.severity, Severity::High);
    }

    #[test]
    fn test_parse_clamps_confidence() {
        let text = r#"{"severity": "low", "root_cause": "x", "recommended_action": "none", "confidence": 1.7, "reasoning": "y"}"#;
        let judgment = parse_judgment(text).unwrap();
        assert!((judgment.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_rejects_unknown_enum() {
        let text = r#"{"severity": "catastrophic", "root_cause": "x", "recommended_action": "none", "confidence": 0.5, "reasoning": "y"}"#;
        let err = parse_judgment(text).unwrap_err();
        assert_eq!(err.kind, super::super::LlmErrorKind::Parse);
    }

    #[test]
    fn test_parse_rejects_no_json() {
        assert!(parse_judgment("I could not classify this.").is_err());
    }

    #[test]
    fn test_prompt_includes_samples_and_hint() {
        let request = AnalysisRequest {
            service_id: "svc-1".into(),
            service_name: "api".into(),
            samples: vec![LogSample {
                timestamp: Utc::now(),
                level: "error".into(),
                message: "connection refused".into(),
            }],
            pattern_hint: Some("high: connection refused".into()),
        };
        let prompt = build_prompt(&request);
        assert!(prompt.contains("connection refused"));
        assert!(prompt.contains("Pattern pre-screen"));
        assert!(prompt.contains("svc-1"));
    }
}
