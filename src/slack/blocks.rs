//! Block Kit rendering for incident alerts and follow-ups

use crate::db::{Incident, RecommendedAction, Severity};
use serde_json::{json, Value};

/// Colored marker shown in the alert header
pub fn severity_marker(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => ":red_circle:",
        Severity::High => ":large_orange_circle:",
        Severity::Medium => ":large_yellow_circle:",
        Severity::Low => ":large_blue_circle:",
    }
}

fn action_label(action: RecommendedAction) -> &'static str {
    match action {
        RecommendedAction::Restart => "Restart the service",
        RecommendedAction::Redeploy => "Redeploy the service",
        RecommendedAction::ScaleMemory => "Scale memory up",
        RecommendedAction::ScaleReplicas => "Add replicas",
        RecommendedAction::Rollback => "Roll back to the previous deployment",
        RecommendedAction::Stop => "Stop the deployment",
        RecommendedAction::ManualFix => "Needs a manual fix",
        RecommendedAction::None => "No action recommended",
    }
}

/// The alert posted when an incident is first detected: header, field grid,
/// root cause, and the `auto_fix | start_chat | ignore` action row. Button
/// values carry `"<action_id>:<incident_id>"`.
pub fn incident_alert(incident: &Incident) -> Vec<Value> {
    let confidence_pct = (incident.confidence * 100.0).round() as i64;
    vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!(
                    "{} {} incident: {}",
                    severity_marker(incident.severity),
                    incident.severity,
                    incident.service_name
                ),
                "emoji": true
            }
        }),
        json!({
            "type": "section",
            "fields": [
                { "type": "mrkdwn", "text": format!("*Service:*\n{}", incident.service_name) },
                { "type": "mrkdwn", "text": format!("*Severity:*\n{}", incident.severity) },
                { "type": "mrkdwn", "text": format!("*Confidence:*\n{confidence_pct}%") },
                {
                    "type": "mrkdwn",
                    "text": format!(
                        "*Detected:*\n{}",
                        incident.detected_at.format("%Y-%m-%d %H:%M:%S UTC")
                    )
                },
            ]
        }),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "*Root cause:* {}\n*Recommended:* {}",
                    incident.root_cause.as_deref().unwrap_or("unknown"),
                    action_label(incident.recommended_action)
                )
            }
        }),
        json!({
            "type": "actions",
            "elements": [
                {
                    "type": "button",
                    "style": "primary",
                    "text": { "type": "plain_text", "text": "Auto-Fix", "emoji": true },
                    "action_id": "auto_fix",
                    "value": format!("auto_fix:{}", incident.id)
                },
                {
                    "type": "button",
                    "text": { "type": "plain_text", "text": "Start Chat", "emoji": true },
                    "action_id": "start_chat",
                    "value": format!("start_chat:{}", incident.id)
                },
                {
                    "type": "button",
                    "style": "danger",
                    "text": { "type": "plain_text", "text": "Ignore", "emoji": true },
                    "action_id": "ignore",
                    "value": format!("ignore:{}", incident.id)
                },
            ]
        }),
    ]
}

/// Confirmation prompt after the auto-fix button, once the refined
/// recommendation is in hand. Confirm carries
/// `"confirm:<incident_id>:<action_name>"`.
pub fn auto_fix_confirmation(incident: &Incident, refined: &str) -> Vec<Value> {
    vec![
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "*Proposed fix for {}:* {}\n{}",
                    incident.service_name,
                    action_label(incident.recommended_action),
                    refined
                )
            }
        }),
        json!({
            "type": "actions",
            "elements": [
                {
                    "type": "button",
                    "style": "primary",
                    "text": { "type": "plain_text", "text": "Confirm", "emoji": true },
                    "action_id": "confirm_auto_fix",
                    "value": format!(
                        "confirm:{}:{}",
                        incident.id,
                        incident.recommended_action
                    )
                },
                {
                    "type": "button",
                    "text": { "type": "plain_text", "text": "Cancel", "emoji": true },
                    "action_id": "cancel_auto_fix",
                    "value": format!("cancel:{}", incident.id)
                },
            ]
        }),
    ]
}
