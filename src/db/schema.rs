//! Database schema and persisted types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS service_policies (
    id TEXT PRIMARY KEY,
    service_id TEXT NOT NULL UNIQUE,
    service_name TEXT NOT NULL,
    auto_remediation_enabled BOOLEAN NOT NULL DEFAULT 0,
    default_memory_mb INTEGER,
    default_replicas INTEGER,
    llm_provider TEXT NOT NULL DEFAULT 'auto',
    confidence_threshold REAL NOT NULL DEFAULT 0.8,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS incidents (
    id TEXT PRIMARY KEY,
    service_id TEXT NOT NULL,
    service_name TEXT NOT NULL,
    environment_id TEXT,
    fingerprint TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'detected',
    confidence REAL NOT NULL DEFAULT 0.0,
    root_cause TEXT,
    recommended_action TEXT NOT NULL DEFAULT 'none',
    reasoning TEXT,
    log_context TEXT NOT NULL DEFAULT '{}',
    detected_at TEXT NOT NULL,
    resolved_at TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',

    UNIQUE (service_id, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status);
CREATE INDEX IF NOT EXISTS idx_incidents_detected ON incidents(detected_at DESC);

CREATE TABLE IF NOT EXISTS remediation_actions (
    id TEXT PRIMARY KEY,
    incident_id TEXT NOT NULL,
    initiator_type TEXT NOT NULL,
    initiator_ref TEXT,
    action_type TEXT NOT NULL,
    parameters TEXT NOT NULL DEFAULT '{}',
    requested_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    result_message TEXT,
    failure_reason TEXT,

    FOREIGN KEY (incident_id) REFERENCES incidents(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_actions_incident ON remediation_actions(incident_id, requested_at);
CREATE INDEX IF NOT EXISTS idx_actions_status ON remediation_actions(status);

CREATE TABLE IF NOT EXISTS conversation_sessions (
    id TEXT PRIMARY KEY,
    incident_id TEXT,
    channel TEXT NOT NULL DEFAULT 'chat',
    channel_ref TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    closed_at TEXT,
    context TEXT NOT NULL DEFAULT '{}',

    UNIQUE (channel, channel_ref),
    FOREIGN KEY (incident_id) REFERENCES incidents(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS conversation_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    action_ref TEXT,

    FOREIGN KEY (session_id) REFERENCES conversation_sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON conversation_messages(session_id, timestamp);

CREATE TABLE IF NOT EXISTS log_events (
    id TEXT PRIMARY KEY,
    service_id TEXT NOT NULL,
    environment_id TEXT,
    service_name TEXT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    severity_score INTEGER NOT NULL,
    raw_metadata TEXT NOT NULL DEFAULT '{}',
    source TEXT
);

CREATE INDEX IF NOT EXISTS idx_log_events_service ON log_events(service_id, timestamp);
"#;

// ============================================================================
// Enums - persisted as short strings, validated on ingress
// ============================================================================

/// Log level as normalized from the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Parse a raw level string, clamping unknown values to `Info`.
    pub fn parse_lossy(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "err" => LogLevel::Error,
            "fatal" | "critical" | "panic" => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }

    /// Severity score in `[1..5]`, derived from the level.
    pub fn severity_score(self) -> u8 {
        match self {
            LogLevel::Debug => 1,
            LogLevel::Info => 2,
            LogLevel::Warn => 3,
            LogLevel::Error => 4,
            LogLevel::Fatal => 5,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident severity band
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Detected,
    AwaitingAction,
    AutoRemediated,
    ManualResolved,
    Failed,
    Ignored,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Detected => "detected",
            IncidentStatus::AwaitingAction => "awaiting_action",
            IncidentStatus::AutoRemediated => "auto_remediated",
            IncidentStatus::ManualResolved => "manual_resolved",
            IncidentStatus::Failed => "failed",
            IncidentStatus::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detected" => Some(IncidentStatus::Detected),
            "awaiting_action" => Some(IncidentStatus::AwaitingAction),
            "auto_remediated" => Some(IncidentStatus::AutoRemediated),
            "manual_resolved" => Some(IncidentStatus::ManualResolved),
            "failed" => Some(IncidentStatus::Failed),
            "ignored" => Some(IncidentStatus::Ignored),
            _ => None,
        }
    }

    /// Terminal statuses never reopen from new detector signals.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IncidentStatus::AutoRemediated | IncidentStatus::ManualResolved | IncidentStatus::Ignored
        )
    }

    /// Whether a caller-driven transition to `next` is allowed.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        use IncidentStatus::{AutoRemediated, AwaitingAction, Detected, Failed, Ignored, ManualResolved};
        match (self, next) {
            // Any state may be manually resolved by a user.
            (_, ManualResolved) => true,
            (Detected, AwaitingAction | Ignored) => true,
            (AwaitingAction, AutoRemediated | Failed) => true,
            // A fresh signal reopens a failed incident.
            (Failed, Detected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action the detector recommends for an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Restart,
    Redeploy,
    ScaleMemory,
    ScaleReplicas,
    Rollback,
    Stop,
    ManualFix,
    #[default]
    None,
}

impl RecommendedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendedAction::Restart => "restart",
            RecommendedAction::Redeploy => "redeploy",
            RecommendedAction::ScaleMemory => "scale_memory",
            RecommendedAction::ScaleReplicas => "scale_replicas",
            RecommendedAction::Rollback => "rollback",
            RecommendedAction::Stop => "stop",
            RecommendedAction::ManualFix => "manual_fix",
            RecommendedAction::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "restart" => Some(RecommendedAction::Restart),
            "redeploy" => Some(RecommendedAction::Redeploy),
            "scale_memory" => Some(RecommendedAction::ScaleMemory),
            "scale_replicas" => Some(RecommendedAction::ScaleReplicas),
            "rollback" => Some(RecommendedAction::Rollback),
            "stop" => Some(RecommendedAction::Stop),
            "manual_fix" => Some(RecommendedAction::ManualFix),
            "none" => Some(RecommendedAction::None),
            _ => None,
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a remediation action actually does against the platform.
///
/// Distinct from [`RecommendedAction`]: a recommendation is what the
/// detector suggests for an incident, while this is what was executed.
/// `Diagnostic` has no recommendation counterpart; it records a
/// read-only investigation with no platform side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Restart,
    Redeploy,
    ScaleMemory,
    ScaleReplicas,
    Rollback,
    Stop,
    Diagnostic,
    ManualFix,
    #[default]
    None,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Restart => "restart",
            ActionType::Redeploy => "redeploy",
            ActionType::ScaleMemory => "scale_memory",
            ActionType::ScaleReplicas => "scale_replicas",
            ActionType::Rollback => "rollback",
            ActionType::Stop => "stop",
            ActionType::Diagnostic => "diagnostic",
            ActionType::ManualFix => "manual_fix",
            ActionType::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "restart" => Some(ActionType::Restart),
            "redeploy" => Some(ActionType::Redeploy),
            "scale_memory" => Some(ActionType::ScaleMemory),
            "scale_replicas" => Some(ActionType::ScaleReplicas),
            "rollback" => Some(ActionType::Rollback),
            "stop" => Some(ActionType::Stop),
            "diagnostic" => Some(ActionType::Diagnostic),
            "manual_fix" => Some(ActionType::ManualFix),
            "none" => Some(ActionType::None),
            _ => None,
        }
    }

    /// The action executed for a detector recommendation. Total: every
    /// recommendation maps onto an executable action.
    pub fn from_recommendation(recommendation: RecommendedAction) -> Self {
        match recommendation {
            RecommendedAction::Restart => ActionType::Restart,
            RecommendedAction::Redeploy => ActionType::Redeploy,
            RecommendedAction::ScaleMemory => ActionType::ScaleMemory,
            RecommendedAction::ScaleReplicas => ActionType::ScaleReplicas,
            RecommendedAction::Rollback => ActionType::Rollback,
            RecommendedAction::Stop => ActionType::Stop,
            RecommendedAction::ManualFix => ActionType::ManualFix,
            RecommendedAction::None => ActionType::None,
        }
    }

    /// Whether executing this action issues a platform RPC.
    pub fn has_side_effect(self) -> bool {
        !matches!(
            self,
            ActionType::Diagnostic | ActionType::ManualFix | ActionType::None
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a remediation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiatorType {
    Automated,
    User,
}

impl InitiatorType {
    pub fn as_str(self) -> &'static str {
        match self {
            InitiatorType::Automated => "automated",
            InitiatorType::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automated" => Some(InitiatorType::Automated),
            "user" => Some(InitiatorType::User),
            _ => None,
        }
    }
}

/// Remediation action status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InProgress => "in_progress",
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "in_progress" => Some(ActionStatus::InProgress),
            "succeeded" => Some(ActionStatus::Succeeded),
            "failed" => Some(ActionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Succeeded | ActionStatus::Failed)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Per-service remediation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePolicy {
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub auto_remediation_enabled: bool,
    pub default_memory_mb: Option<i64>,
    pub default_replicas: Option<i64>,
    pub llm_provider: String,
    pub confidence_threshold: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A deduplicated incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub environment_id: Option<String>,
    pub fingerprint: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub confidence: f64,
    pub root_cause: Option<String>,
    pub recommended_action: RecommendedAction,
    pub reasoning: Option<String>,
    pub log_context: serde_json::Value,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// A remediation attempt against an incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub id: String,
    pub incident_id: String,
    pub initiator_type: InitiatorType,
    pub initiator_ref: Option<String>,
    pub action_type: ActionType,
    pub parameters: serde_json::Value,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ActionStatus,
    pub result_message: Option<String>,
    pub failure_reason: Option<String>,
}

/// A chat-thread conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub incident_id: Option<String>,
    pub channel: String,
    pub channel_ref: String,
    pub participant_id: String,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub context: serde_json::Value,
}

/// One message inside a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub action_ref: Option<String>,
}

/// A normalized log event flowing from the stream to the detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub service_id: String,
    pub environment_id: Option<String>,
    pub service_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub raw_metadata: HashMap<String, serde_json::Value>,
    pub source: Option<String>,
}

impl LogEvent {
    pub fn severity_score(&self) -> u8 {
        self.level.severity_score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_lossy_clamps_unknown() {
        assert_eq!(LogLevel::parse_lossy("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::parse_lossy("panic"), LogLevel::Fatal);
        assert_eq!(LogLevel::parse_lossy("verbose"), LogLevel::Info);
        assert_eq!(LogLevel::parse_lossy(""), LogLevel::Info);
    }

    #[test]
    fn test_severity_scores_match_levels() {
        let cases = [
            (LogLevel::Debug, 1),
            (LogLevel::Info, 2),
            (LogLevel::Warn, 3),
            (LogLevel::Error, 4),
            (LogLevel::Fatal, 5),
        ];
        for (level, score) in cases {
            assert_eq!(level.severity_score(), score);
        }
    }

    #[test]
    fn test_status_transitions() {
        use IncidentStatus::{
            AutoRemediated, AwaitingAction, Detected, Failed, Ignored, ManualResolved,
        };
        assert!(Detected.can_transition_to(AwaitingAction));
        assert!(Detected.can_transition_to(Ignored));
        assert!(AwaitingAction.can_transition_to(AutoRemediated));
        assert!(AwaitingAction.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Detected));
        assert!(Ignored.can_transition_to(ManualResolved));

        assert!(!Detected.can_transition_to(AutoRemediated));
        assert!(!AutoRemediated.can_transition_to(Detected));
        assert!(!Ignored.can_transition_to(Detected));
    }

    #[test]
    fn test_enum_string_round_trips() {
        for s in [
            IncidentStatus::Detected,
            IncidentStatus::AwaitingAction,
            IncidentStatus::AutoRemediated,
            IncidentStatus::ManualResolved,
            IncidentStatus::Failed,
            IncidentStatus::Ignored,
        ] {
            assert_eq!(IncidentStatus::parse(s.as_str()), Some(s));
        }
        for a in [
            RecommendedAction::Restart,
            RecommendedAction::Redeploy,
            RecommendedAction::ScaleMemory,
            RecommendedAction::ScaleReplicas,
            RecommendedAction::Rollback,
            RecommendedAction::Stop,
            RecommendedAction::ManualFix,
            RecommendedAction::None,
        ] {
            assert_eq!(RecommendedAction::parse(a.as_str()), Some(a));
        }
        for t in [
            ActionType::Restart,
            ActionType::Redeploy,
            ActionType::ScaleMemory,
            ActionType::ScaleReplicas,
            ActionType::Rollback,
            ActionType::Stop,
            ActionType::Diagnostic,
            ActionType::ManualFix,
            ActionType::None,
        ] {
            assert_eq!(ActionType::parse(t.as_str()), Some(t));
        }
        assert_eq!(IncidentStatus::parse("resolved"), None);
    }

    #[test]
    fn test_action_type_from_recommendation_is_total() {
        let cases = [
            (RecommendedAction::Restart, ActionType::Restart),
            (RecommendedAction::Redeploy, ActionType::Redeploy),
            (RecommendedAction::ScaleMemory, ActionType::ScaleMemory),
            (RecommendedAction::ScaleReplicas, ActionType::ScaleReplicas),
            (RecommendedAction::Rollback, ActionType::Rollback),
            (RecommendedAction::Stop, ActionType::Stop),
            (RecommendedAction::ManualFix, ActionType::ManualFix),
            (RecommendedAction::None, ActionType::None),
        ];
        for (recommendation, action_type) in cases {
            assert_eq!(ActionType::from_recommendation(recommendation), action_type);
        }
        // Diagnostic is reachable only by direct construction, never from
        // a recommendation.
        assert_eq!(ActionType::parse("diagnostic"), Some(ActionType::Diagnostic));
    }

    #[test]
    fn test_side_effect_classification() {
        assert!(ActionType::Restart.has_side_effect());
        assert!(ActionType::Rollback.has_side_effect());
        assert!(!ActionType::Diagnostic.has_side_effect());
        assert!(!ActionType::ManualFix.has_side_effect());
        assert!(!ActionType::None.has_side_effect());
    }
}
