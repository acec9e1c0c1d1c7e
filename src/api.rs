//! HTTP surface: Slack webhooks, health, and stats
//!
//! Both Slack endpoints verify the request signature against the raw body
//! before anything is parsed, acknowledge fast, and push the real work to
//! background tasks.

use crate::broker::Broker;
use crate::config::Config;
use crate::conversation::{slash_channel_ref, ConversationManager};
use crate::db::{Database, IncidentStatus, InitiatorType, RecommendedAction};
use crate::detector::IngestBus;
use crate::events::{topics, PipelineEvent};
use crate::llm::AnalystRegistry;
use crate::railway::RailwayClient;
use crate::slack::{self, SlackNotifier};
use crate::stream::SubscriptionSupervisor;
use crate::telemetry::Telemetry;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const DB_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub broker: Arc<Broker>,
    pub railway: Arc<RailwayClient>,
    pub analysts: Arc<AnalystRegistry>,
    pub notifier: Arc<SlackNotifier>,
    pub telemetry: Arc<Telemetry>,
    pub supervisor: Arc<SubscriptionSupervisor>,
    pub conversations: Arc<ConversationManager>,
    pub ingest: Arc<IngestBus>,
    pub http: reqwest::Client,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/interactive", post(interactive))
        .route("/slash", post(slash))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

// ============================================================
// Signature gate
// ============================================================

/// Verify the Slack signature for a raw body. Returns an HTTP error when
/// the integration is disabled or the signature does not check out.
fn verify_signature(
    state: &AppState,
    headers: &HeaderMap,
    body: &str,
) -> Result<(), (StatusCode, &'static str)> {
    let Some(secret) = state.config.slack.signing_secret.as_deref() else {
        // Development without Slack configured: the endpoints are dark.
        // Production startup already refused this state.
        return Err((StatusCode::SERVICE_UNAVAILABLE, "slack integration disabled"));
    };

    let timestamp = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let signature = headers
        .get("x-slack-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    slack::verify(secret, timestamp, signature, body, Utc::now().timestamp())
        .map_err(|_| (StatusCode::UNAUTHORIZED, "signature verification failed"))
}

// ============================================================
// Interactive actions
// ============================================================

/// Parsed form of a button value
#[derive(Debug, Clone, PartialEq, Eq)]
enum ActionValue {
    /// `"<action_id>:<incident_id>"`
    Simple {
        action: String,
        incident_id: String,
    },
    /// `"confirm:<incident_id>:<action_name>"`
    Confirm {
        incident_id: String,
        action: RecommendedAction,
    },
    /// `"cancel:<incident_id>"`
    Cancel { incident_id: String },
}

fn parse_action_value(value: &str) -> Option<ActionValue> {
    let mut parts = value.splitn(3, ':');
    let head = parts.next()?;
    let incident_id = parts.next()?.to_string();
    if incident_id.is_empty() {
        return None;
    }
    match head {
        "confirm" => {
            let action = RecommendedAction::parse(parts.next()?)?;
            Some(ActionValue::Confirm {
                incident_id,
                action,
            })
        }
        "cancel" => Some(ActionValue::Cancel { incident_id }),
        action => Some(ActionValue::Simple {
            action: action.to_string(),
            incident_id,
        }),
    }
}

/// Decode an `application/x-www-form-urlencoded` body into a map.
///
/// Runs over the owned raw body only after signature verification; form
/// encoding uses `+` for spaces on top of percent escapes.
fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((decode_component(key), decode_component(value)))
        })
        .collect()
}

fn decode_component(input: &str) -> String {
    let plus_decoded = input.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or(plus_decoded)
}

async fn interactive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Err(rejection) = verify_signature(&state, &headers, &body) {
        return rejection.into_response();
    }

    let form = parse_form(&body);
    let Some(payload_raw) = form.get("payload") else {
        return (StatusCode::BAD_REQUEST, "missing payload").into_response();
    };
    let Ok(payload) = serde_json::from_str::<Value>(payload_raw) else {
        return (StatusCode::BAD_REQUEST, "malformed payload").into_response();
    };

    if payload.pointer("/type").and_then(Value::as_str) != Some("block_actions") {
        // Unknown interaction kinds are acknowledged and ignored.
        return StatusCode::OK.into_response();
    }

    let user_id = payload
        .pointer("/user/id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let channel_id = payload
        .pointer("/channel/id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let thread_ts = payload
        .pointer("/message/thread_ts")
        .or_else(|| payload.pointer("/message/ts"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let actions = payload
        .pointer("/actions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for action in actions {
        let Some(value) = action.pointer("/value").and_then(Value::as_str) else {
            continue;
        };
        let Some(parsed) = parse_action_value(value) else {
            tracing::warn!(value, "unparseable action value");
            continue;
        };
        // Ack within the deadline; the handler does the slow parts.
        let state = state.clone();
        let user_id = user_id.clone();
        let channel_id = channel_id.clone();
        let thread_ts = thread_ts.clone();
        tokio::spawn(async move {
            dispatch_action(&state, parsed, &user_id, &channel_id, &thread_ts).await;
        });
    }

    StatusCode::OK.into_response()
}

async fn dispatch_action(
    state: &AppState,
    value: ActionValue,
    user_id: &str,
    channel_id: &str,
    thread_ts: &str,
) {
    match value {
        ActionValue::Simple { action, incident_id } => match action.as_str() {
            "auto_fix" => refine_and_confirm(state, &incident_id).await,
            "start_chat" => {
                state.broker.publish(
                    topics::CONVERSATIONS_EVENTS,
                    PipelineEvent::StartChat {
                        incident_id,
                        channel_id: channel_id.to_string(),
                        user_id: user_id.to_string(),
                        thread_ts: thread_ts.to_string(),
                    },
                );
            }
            "ignore" => ignore_incident(state, &incident_id, user_id).await,
            other => tracing::warn!(action = other, "unknown interactive action"),
        },
        ActionValue::Confirm {
            incident_id,
            action,
        } => {
            state.broker.publish(
                topics::REMEDIATION_ACTIONS,
                PipelineEvent::AutoFixRequested {
                    incident_id,
                    initiator: InitiatorType::User,
                    initiator_ref: Some(user_id.to_string()),
                    action: Some(action),
                    parameters: None,
                },
            );
        }
        ActionValue::Cancel { incident_id } => {
            let _ = state
                .notifier
                .post_thread_reply(&incident_id, "Auto-fix cancelled.")
                .await;
        }
    }
}

/// The auto-fix button: pull recent deployment logs, ask the model for a
/// refined recommendation, then post the confirm/cancel prompt.
async fn refine_and_confirm(state: &AppState, incident_id: &str) {
    let incident = match state.db.get_incident(incident_id) {
        Ok(incident) => incident,
        Err(e) => {
            tracing::warn!(incident_id, error = %e, "auto_fix on unknown incident");
            return;
        }
    };

    let mut refined = String::from("No additional context available.");
    if let Some(environment_id) = incident.environment_id.as_deref() {
        if let Ok(deployment_id) = state
            .railway
            .latest_deployment_id(environment_id, &incident.service_id)
            .await
        {
            if let Ok(lines) = state.railway.deployment_logs(&deployment_id, 50).await {
                let log_text: String = lines
                    .iter()
                    .map(|l| l.message.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                if let Some(analyst) = state.analysts.select("auto") {
                    let prompt = format!(
                        "An incident was detected on service {}. Root cause so far: {}. \
                         Recommended action: {}. Given these recent deployment logs, \
                         confirm or refine the recommendation in two sentences.\n\n{}",
                        incident.service_name,
                        incident.root_cause.as_deref().unwrap_or("unknown"),
                        incident.recommended_action,
                        log_text
                    );
                    if let Ok(reply) = analyst.respond(&prompt).await {
                        refined = reply;
                    }
                }
            }
        }
    }

    match state.notifier.post_confirmation(&incident, &refined).await {
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "confirmation post failed"),
    }
}

async fn ignore_incident(state: &AppState, incident_id: &str, user_id: &str) {
    match state.db.transition_incident(incident_id, IncidentStatus::Ignored) {
        Ok(incident) => {
            let text = format!(
                "Incident on {} ignored by <@{}>.",
                incident.service_name, user_id
            );
            let _ = state.notifier.post_thread_reply(incident_id, &text).await;
        }
        Err(e) => {
            tracing::warn!(incident_id, error = %e, "ignore transition failed");
            let _ = state
                .notifier
                .post_thread_reply(incident_id, "Could not ignore this incident.")
                .await;
        }
    }
}

// ============================================================
// Slash commands
// ============================================================

async fn slash(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Err(rejection) = verify_signature(&state, &headers, &body) {
        return rejection.into_response();
    }

    let form = parse_form(&body);
    let text = form.get("text").cloned().unwrap_or_default();
    let user_id = form.get("user_id").cloned().unwrap_or_default();
    let channel_id = form.get("channel_id").cloned().unwrap_or_default();
    let response_url = form.get("response_url").cloned();

    // The actual work is asynchronous; the reply goes to response_url.
    let state_bg = state.clone();
    tokio::spawn(async move {
        let channel_ref = slash_channel_ref(&channel_id, &user_id);
        let reply = match state_bg
            .conversations
            .handle_message(&channel_ref, &user_id, &text)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "slash command handling failed");
                "Something went wrong handling that command.".to_string()
            }
        };
        if let Some(url) = response_url {
            let result = state_bg
                .http
                .post(&url)
                .json(&json!({ "response_type": "ephemeral", "text": reply }))
                .send()
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "response_url post failed");
            }
        }
    });

    Json(json!({
        "response_type": "ephemeral",
        "text": "Processing your request..."
    }))
    .into_response()
}

// ============================================================
// Health and stats
// ============================================================

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db = state.db.clone();
    let probe = tokio::time::timeout(
        DB_PROBE_TIMEOUT,
        tokio::task::spawn_blocking(move || db.health_check()),
    )
    .await;
    let database = match probe {
        Ok(Ok(Ok(()))) => "ok",
        Ok(Ok(Err(_))) => "error",
        _ => "degraded",
    };

    let log_stream = if state.supervisor.any_connected().await {
        "ok"
    } else {
        "degraded"
    };

    let status = if database == "ok" && log_stream == "ok" {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "components": {
            "app": "ok",
            "database": database,
            "log_stream": log_stream,
        }
    }))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let connections = state.supervisor.list_connections().await;
    let connected = connections.iter().filter(|c| c.connected).count();
    state
        .telemetry
        .logs_dropped
        .store(state.ingest.dropped(), std::sync::atomic::Ordering::Relaxed);
    let snapshot = state.telemetry.snapshot(connections.len(), connected);
    Json(json!({
        "telemetry": snapshot,
        "connections": connections,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action_values() {
        assert_eq!(
            parse_action_value("auto_fix:inc-1"),
            Some(ActionValue::Simple {
                action: "auto_fix".into(),
                incident_id: "inc-1".into()
            })
        );
        assert_eq!(
            parse_action_value("confirm:inc-1:restart"),
            Some(ActionValue::Confirm {
                incident_id: "inc-1".into(),
                action: RecommendedAction::Restart
            })
        );
        assert_eq!(
            parse_action_value("cancel:inc-1"),
            Some(ActionValue::Cancel {
                incident_id: "inc-1".into()
            })
        );
        assert_eq!(parse_action_value("confirm:inc-1:teleport"), None);
        assert_eq!(parse_action_value("garbage"), None);
        assert_eq!(parse_action_value("ignore:"), None);
    }

    #[test]
    fn test_parse_form_decodes_payload() {
        let form = parse_form("payload=%7B%22type%22%3A%22block_actions%22%7D&foo=a+b");
        assert_eq!(
            form.get("payload").unwrap(),
            r#"{"type":"block_actions"}"#
        );
        assert_eq!(form.get("foo").unwrap(), "a b");
    }

    #[test]
    fn test_decode_component_handles_plus_and_invalid_escapes() {
        assert_eq!(decode_component("a+b"), "a b");
        assert_eq!(decode_component("%2f"), "/");
        // Invalid escapes fall back to the plus-decoded input untouched.
        assert_eq!(decode_component("abc%zz"), "abc%zz");
    }
}
