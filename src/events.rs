//! Typed payloads carried by the pipeline broker

use crate::db::{Incident, InitiatorType, RecommendedAction};
use serde::Serialize;

/// Well-known topic names
pub mod topics {
    pub const INCIDENTS_NEW: &str = "incidents:new";
    pub const DASHBOARD_INCIDENTS: &str = "dashboard:incidents";
    pub const CONVERSATIONS_EVENTS: &str = "conversations:events";
    pub const REMEDIATION_ACTIONS: &str = "remediation:actions";
    pub const POLICY_UPDATED: &str = "policy:updated";

    pub fn railway_logs(service_id: &str) -> String {
        format!("railway:logs:{service_id}")
    }

    pub fn railway_connections(project_id: &str) -> String {
        format!("railway:connections:{project_id}")
    }
}

/// How an upsert landed, for subscribers that care about novelty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    Created,
    Updated,
}

/// One broker message
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A new or refreshed incident was persisted
    IncidentDetected {
        incident: Box<Incident>,
        kind: UpsertKind,
    },
    /// A user or policy asked for the recommended remediation
    AutoFixRequested {
        incident_id: String,
        initiator: InitiatorType,
        initiator_ref: Option<String>,
        /// Overrides the incident's recommended action when present
        action: Option<RecommendedAction>,
        /// Action parameters (e.g. `memory_mb`, `num_replicas`)
        parameters: Option<serde_json::Value>,
    },
    /// A user opened a chat thread for an incident
    StartChat {
        incident_id: String,
        channel_id: String,
        user_id: String,
        thread_ts: String,
    },
    /// A remediation reached a terminal state
    RemediationCompleted {
        incident_id: String,
        action_id: String,
        success: bool,
        message: String,
    },
    /// A remediation request was refused without side effects
    RemediationSkipped {
        incident_id: String,
        reason: String,
    },
    /// A service policy changed; caches must refresh
    PolicyUpdated { service_id: String },
    /// Per-service log batch marker for dashboard consumers
    LogVolume { service_id: String, count: u64 },
}
