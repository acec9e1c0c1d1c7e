//! GraphQL-over-WebSocket frame codec and log normalization
//!
//! Implements the `graphql-transport-ws` lifecycle frames
//! (`connection_init -> connection_ack -> subscribe -> next|error|complete`)
//! and the normalization of raw log entries into [`LogEvent`]s.

use crate::db::{LogEvent, LogLevel};
use crate::stream::MonitoringTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Maximum persisted message length; longer lines are truncated on ingress.
const MAX_MESSAGE_CHARS: usize = 10_000;

/// One protocol frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    ConnectionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    ConnectionAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Next {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Payload of a `subscribe` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
}

/// Build the default subscription query for a target.
///
/// Targets without a service subscribe to `environmentLogs` filtered to
/// `level:error`; service-scoped targets narrow the filter to
/// `service:<id> level:<level>`.
pub fn subscription_query(target: &MonitoringTarget, level_filter: &str) -> SubscribePayload {
    let filter = match &target.service_id {
        Some(service_id) => format!("service:{service_id} level:{level_filter}"),
        None => format!("level:{level_filter}"),
    };
    SubscribePayload {
        query: r"subscription environmentLogs($environmentId: String!, $filter: String!) {
            environmentLogs(environmentId: $environmentId, filter: $filter) {
                timestamp severity message attributes { key value }
            }
        }"
        .to_string(),
        variables: Some(serde_json::json!({
            "environmentId": target.environment_id,
            "filter": filter,
        })),
    }
}

/// Extract and normalize log entries from a `next` frame payload.
///
/// Accepts both `environmentLogs` and `deploymentLogs` data shapes. Entries
/// missing a timestamp are stamped with `now`; unknown levels clamp to
/// `info`; messages truncate at the persistence bound.
pub fn extract_log_events(payload: &Value, target: &MonitoringTarget) -> Vec<LogEvent> {
    let entries = payload
        .pointer("/data/environmentLogs")
        .or_else(|| payload.pointer("/data/deploymentLogs"))
        .and_then(Value::as_array);

    let Some(entries) = entries else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| normalize_entry(entry, target))
        .collect()
}

fn normalize_entry(entry: &Value, target: &MonitoringTarget) -> Option<LogEvent> {
    let message_raw = entry.get("message")?.as_str()?;
    let mut message = message_raw.to_string();
    if message.chars().count() > MAX_MESSAGE_CHARS {
        message = message.chars().take(MAX_MESSAGE_CHARS).collect();
    }

    let timestamp = entry
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));

    let level = entry
        .get("severity")
        .and_then(Value::as_str)
        .map_or(LogLevel::Info, LogLevel::parse_lossy);

    let mut raw_metadata = HashMap::new();
    if let Some(attributes) = entry.get("attributes").and_then(Value::as_array) {
        for attribute in attributes {
            if let (Some(key), Some(value)) = (
                attribute.get("key").and_then(Value::as_str),
                attribute.get("value"),
            ) {
                raw_metadata.insert(key.to_string(), value.clone());
            }
        }
    }

    Some(LogEvent {
        service_id: target
            .service_id
            .clone()
            .unwrap_or_else(|| target.environment_id.clone()),
        environment_id: Some(target.environment_id.clone()),
        service_name: target.service_name.clone(),
        timestamp,
        level,
        message,
        raw_metadata,
        source: Some("railway".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> MonitoringTarget {
        MonitoringTarget {
            project_id: "proj-1".into(),
            environment_id: "env-1".into(),
            service_id: Some("svc-1".into()),
            service_name: Some("api".into()),
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let frames = [
            Frame::ConnectionInit { payload: None },
            Frame::Ping { payload: None },
            Frame::Complete { id: "sub-1".into() },
            Frame::Subscribe {
                id: "sub-1".into(),
                payload: subscription_query(&target(), "error"),
            },
        ];
        for frame in frames {
            let parsed = Frame::parse(&frame.to_json()).unwrap();
            assert_eq!(parsed, frame);
        }
    }

    #[test]
    fn test_parse_lifecycle_type_strings() {
        let ack = Frame::parse(r#"{"type":"connection_ack"}"#).unwrap();
        assert!(matches!(ack, Frame::ConnectionAck { .. }));
        let ping = Frame::parse(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, Frame::Ping { .. }));
    }

    #[test]
    fn test_subscription_filter_with_and_without_service() {
        let with_service = subscription_query(&target(), "error");
        let variables = with_service.variables.unwrap();
        assert_eq!(
            variables.pointer("/filter").unwrap().as_str().unwrap(),
            "service:svc-1 level:error"
        );

        let mut env_target = target();
        env_target.service_id = None;
        let without_service = subscription_query(&env_target, "error");
        let variables = without_service.variables.unwrap();
        assert_eq!(
            variables.pointer("/filter").unwrap().as_str().unwrap(),
            "level:error"
        );
    }

    #[test]
    fn test_extract_normalizes_entries() {
        let payload = serde_json::json!({
            "data": {
                "environmentLogs": [
                    {
                        "timestamp": "2026-01-05T10:00:00Z",
                        "severity": "ERROR",
                        "message": "connection refused",
                        "attributes": [{"key": "pod", "value": "api-0"}]
                    },
                    {
                        "severity": "weird",
                        "message": "no timestamp here"
                    }
                ]
            }
        });
        let events = extract_log_events(&payload, &target());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, LogLevel::Error);
        assert_eq!(events[0].service_id, "svc-1");
        assert_eq!(
            events[0].raw_metadata.get("pod").unwrap().as_str().unwrap(),
            "api-0"
        );
        // Unknown level clamps, missing timestamp stamps now.
        assert_eq!(events[1].level, LogLevel::Info);
    }

    #[test]
    fn test_extract_truncates_oversized_messages() {
        let long = "x".repeat(MAX_MESSAGE_CHARS + 500);
        let payload = serde_json::json!({
            "data": { "environmentLogs": [{ "severity": "error", "message": long }] }
        });
        let events = extract_log_events(&payload, &target());
        assert_eq!(events[0].message.chars().count(), MAX_MESSAGE_CHARS);
    }

    #[test]
    fn test_extract_ignores_unrelated_payloads() {
        let payload = serde_json::json!({ "data": { "somethingElse": [] } });
        assert!(extract_log_events(&payload, &target()).is_empty());
    }
}
