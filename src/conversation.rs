//! Conversation manager
//!
//! Owns chat-thread sessions keyed by `(channel, channel_ref)`. Inbound
//! posts append user messages, a fixed intent grammar drives read-only
//! platform queries or user-initiated remediation, and idle sessions close
//! on a sweep.

use crate::broker::Broker;
use crate::db::{
    Database, DbError, IncidentStatus, InitiatorType, MessageRole, RecommendedAction,
};
use crate::events::{topics, PipelineEvent};
use crate::llm::AnalystRegistry;
use crate::railway::RailwayClient;
use crate::telemetry::Telemetry;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Sessions idle past this are closed by the sweep.
const IDLE_TIMEOUT_MINUTES: i64 = 60;
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const CHANNEL: &str = "chat";

/// The fixed intent grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Status,
    Logs,
    Deployments,
    Restart,
    Redeploy,
    Stop,
    ScaleMemory(u32),
    ScaleReplicas(u32),
    Rollback,
    Resolve,
    Help,
    Unknown,
}

/// Classify free text into an intent. Matching is keyword-first and
/// case-insensitive; anything unmatched is `Unknown`.
pub fn parse_intent(text: &str) -> Intent {
    let lowered = text.trim().to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();

    if let Some(position) = words.iter().position(|w| *w == "scale") {
        match (words.get(position + 1), words.get(position + 2)) {
            (Some(&"memory"), Some(value)) => {
                if let Ok(mb) = value.trim_end_matches("mb").parse() {
                    return Intent::ScaleMemory(mb);
                }
            }
            (Some(&"replicas"), Some(value)) => {
                if let Ok(count) = value.parse() {
                    return Intent::ScaleReplicas(count);
                }
            }
            _ => {}
        }
    }

    match () {
        () if words.contains(&"status") => Intent::Status,
        () if words.contains(&"logs") || words.contains(&"log") => Intent::Logs,
        () if words.contains(&"deployments") || words.contains(&"deploys") => Intent::Deployments,
        () if words.contains(&"restart") => Intent::Restart,
        () if words.contains(&"redeploy") => Intent::Redeploy,
        () if words.contains(&"rollback") => Intent::Rollback,
        () if words.contains(&"stop") => Intent::Stop,
        () if words.contains(&"resolve") || words.contains(&"resolved") => Intent::Resolve,
        () if words.contains(&"help") => Intent::Help,
        () => Intent::Unknown,
    }
}

const HELP_TEXT: &str = "I can help with: `status`, `logs`, `deployments`, \
`restart`, `redeploy`, `stop`, `scale memory <mb>`, `scale replicas <n>`, \
`rollback`, `resolve`, `help`.";

/// Per-thread session state and intent dispatch
pub struct ConversationManager {
    db: Database,
    broker: Arc<Broker>,
    railway: Arc<RailwayClient>,
    analysts: Arc<AnalystRegistry>,
    telemetry: Arc<Telemetry>,
    default_project: Option<String>,
}

impl ConversationManager {
    pub fn new(
        db: Database,
        broker: Arc<Broker>,
        railway: Arc<RailwayClient>,
        analysts: Arc<AnalystRegistry>,
        telemetry: Arc<Telemetry>,
        default_project: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            broker,
            railway,
            analysts,
            telemetry,
            default_project,
        })
    }

    /// Event loop: opens sessions on `start_chat` and sweeps idle ones.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.broker.subscribe(topics::CONVERSATIONS_EVENTS);
        let mut sweep = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PipelineEvent::StartChat { incident_id, channel_id, user_id, thread_ts }) => {
                        let channel_ref = format!("{channel_id}:{thread_ts}");
                        if let Err(e) = self.open_session(&channel_ref, &user_id, Some(&incident_id)) {
                            tracing::error!(error = %e, "session open failed");
                            self.telemetry.record_error("conversation", "open");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "conversation manager lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => self.close_idle_sessions(),
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("conversation manager stopped");
    }

    /// Find-or-create the session for a thread and seed the system message.
    pub fn open_session(
        &self,
        channel_ref: &str,
        participant_id: &str,
        incident_id: Option<&str>,
    ) -> Result<String, DbError> {
        let session =
            self.db
                .find_or_create_session(CHANNEL, channel_ref, participant_id, incident_id)?;
        if self.db.list_messages(&session.id)?.is_empty() {
            self.db.append_message(
                &session.id,
                MessageRole::System,
                "Chat session started",
                None,
            )?;
        }
        Ok(session.id)
    }

    /// Handle one inbound post: persist the user message, execute the
    /// intent, persist and return the assistant reply.
    pub async fn handle_message(
        &self,
        channel_ref: &str,
        participant_id: &str,
        text: &str,
    ) -> Result<String, DbError> {
        let started = std::time::Instant::now();
        let session_id = self.open_session(channel_ref, participant_id, None)?;
        self.db
            .append_message(&session_id, MessageRole::User, text, None)?;

        let session = self.db.get_session_by_ref(CHANNEL, channel_ref)?;
        let intent = parse_intent(text);
        let reply = self.execute_intent(&intent, session.incident_id.as_deref(), text).await;

        self.db
            .append_message(&session_id, MessageRole::Assistant, &reply, None)?;
        self.telemetry.record_conversation_latency(started.elapsed());

        if intent == Intent::Resolve {
            self.db.close_session(&session_id)?;
        }
        Ok(reply)
    }

    #[allow(clippy::too_many_lines)] // one arm per intent
    async fn execute_intent(
        &self,
        intent: &Intent,
        incident_id: Option<&str>,
        original_text: &str,
    ) -> String {
        match intent {
            Intent::Status => match incident_id {
                Some(id) => match self.db.get_incident(id) {
                    Ok(incident) => format!(
                        "Incident on {} is `{}` (severity {}, confidence {:.0}%).",
                        incident.service_name,
                        incident.status,
                        incident.severity,
                        incident.confidence * 100.0
                    ),
                    Err(_) => "I could not find that incident any more.".to_string(),
                },
                None => match self.db.list_recent_incidents(5) {
                    Ok(incidents) if incidents.is_empty() => {
                        "No incidents on record. All quiet.".to_string()
                    }
                    Ok(incidents) => {
                        let lines: Vec<String> = incidents
                            .iter()
                            .map(|i| {
                                format!("- {} [{}] {}", i.service_name, i.severity, i.status)
                            })
                            .collect();
                        format!("Recent incidents:\n{}", lines.join("\n"))
                    }
                    Err(_) => "Incident lookup failed.".to_string(),
                },
            },
            Intent::Logs => match self.latest_deployment_for(incident_id).await {
                Some(deployment_id) => {
                    match self.railway.deployment_logs(&deployment_id, 20).await {
                        Ok(lines) if lines.is_empty() => "No recent log lines.".to_string(),
                        Ok(lines) => {
                            let rendered: Vec<String> = lines
                                .iter()
                                .map(|l| {
                                    format!(
                                        "{} {}",
                                        l.severity.as_deref().unwrap_or("info"),
                                        l.message
                                    )
                                })
                                .collect();
                            format!("```\n{}\n```", rendered.join("\n"))
                        }
                        Err(e) => format!("Log fetch failed: {e}"),
                    }
                }
                None => "I need an incident context to fetch logs.".to_string(),
            },
            Intent::Deployments => {
                let Some(incident_id) = incident_id else {
                    return "I need an incident context to list deployments.".to_string();
                };
                let Ok(incident) = self.db.get_incident(incident_id) else {
                    return "I could not find that incident any more.".to_string();
                };
                let (Some(project), Some(environment)) = (
                    self.default_project.as_deref(),
                    incident.environment_id.as_deref(),
                ) else {
                    return "Deployment listing is not configured.".to_string();
                };
                match self
                    .railway
                    .deployments(project, environment, &incident.service_id, 5)
                    .await
                {
                    Ok(deployments) if deployments.is_empty() => {
                        "No deployments found.".to_string()
                    }
                    Ok(deployments) => {
                        let lines: Vec<String> = deployments
                            .iter()
                            .map(|d| format!("- {} ({}) {}", d.id, d.status, d.created_at))
                            .collect();
                        format!("Deployments:\n{}", lines.join("\n"))
                    }
                    Err(e) => format!("Deployment lookup failed: {e}"),
                }
            }
            Intent::Restart => self.request_fix(incident_id, RecommendedAction::Restart, None),
            Intent::Redeploy => self.request_fix(incident_id, RecommendedAction::Redeploy, None),
            Intent::Stop => self.request_fix(incident_id, RecommendedAction::Stop, None),
            Intent::Rollback => self.request_fix(incident_id, RecommendedAction::Rollback, None),
            Intent::ScaleMemory(mb) => self.request_fix(
                incident_id,
                RecommendedAction::ScaleMemory,
                Some(serde_json::json!({ "memory_mb": mb })),
            ),
            Intent::ScaleReplicas(n) => self.request_fix(
                incident_id,
                RecommendedAction::ScaleReplicas,
                Some(serde_json::json!({ "num_replicas": n })),
            ),
            Intent::Resolve => match incident_id {
                Some(id) => match self
                    .db
                    .transition_incident(id, IncidentStatus::ManualResolved)
                {
                    Ok(_) => "Marked the incident resolved. Closing this session.".to_string(),
                    Err(e) => format!("Could not resolve the incident: {e}"),
                },
                None => "Nothing to resolve here; closing this session.".to_string(),
            },
            Intent::Help => HELP_TEXT.to_string(),
            Intent::Unknown => {
                // Free-form questions get a model answer when a provider is
                // configured; otherwise point at the grammar.
                if let Some(analyst) = self.analysts.select("auto") {
                    let prompt = format!(
                        "You are an incident-response assistant for cloud services. \
                         Answer briefly and practically.\n\nUser: {original_text}"
                    );
                    match analyst.respond(&prompt).await {
                        Ok(reply) => reply,
                        Err(_) => HELP_TEXT.to_string(),
                    }
                } else {
                    HELP_TEXT.to_string()
                }
            }
        }
    }

    async fn latest_deployment_for(&self, incident_id: Option<&str>) -> Option<String> {
        let incident_id = incident_id?;
        let incident = self.db.get_incident(incident_id).ok()?;
        let environment_id = incident.environment_id.clone()?;
        self.railway
            .latest_deployment_id(&environment_id, &incident.service_id)
            .await
            .ok()
    }

    /// Mutating intents become user-initiated auto-fix requests.
    fn request_fix(
        &self,
        incident_id: Option<&str>,
        action: RecommendedAction,
        parameters: Option<serde_json::Value>,
    ) -> String {
        let Some(incident_id) = incident_id else {
            return "This thread has no incident attached; nothing to fix.".to_string();
        };
        self.broker.publish(
            topics::REMEDIATION_ACTIONS,
            PipelineEvent::AutoFixRequested {
                incident_id: incident_id.to_string(),
                initiator: InitiatorType::User,
                initiator_ref: None,
                action: Some(action),
                parameters,
            },
        );
        format!("On it. Requested `{action}` for this incident; updates will land in this thread.")
    }

    fn close_idle_sessions(&self) {
        let cutoff = Utc::now() - ChronoDuration::minutes(IDLE_TIMEOUT_MINUTES);
        match self.db.list_idle_sessions(cutoff) {
            Ok(sessions) => {
                for session in sessions {
                    tracing::info!(session_id = %session.id, "closing idle session");
                    if let Err(e) = self.db.close_session(&session.id) {
                        tracing::warn!(error = %e, "idle close failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "idle session sweep failed");
                self.telemetry.record_error("conversation", "sweep");
            }
        }
    }
}

/// Session key for slash commands, which have no thread to anchor on.
pub fn slash_channel_ref(channel_id: &str, user_id: &str) -> String {
    format!("{channel_id}:slash:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    #[test]
    fn test_intent_grammar() {
        assert_eq!(parse_intent("status"), Intent::Status);
        assert_eq!(parse_intent("show me the LOGS please"), Intent::Logs);
        assert_eq!(parse_intent("list deployments"), Intent::Deployments);
        assert_eq!(parse_intent("restart it"), Intent::Restart);
        assert_eq!(parse_intent("redeploy"), Intent::Redeploy);
        assert_eq!(parse_intent("stop the service"), Intent::Stop);
        assert_eq!(parse_intent("scale memory 2048"), Intent::ScaleMemory(2048));
        assert_eq!(parse_intent("scale memory 512mb"), Intent::ScaleMemory(512));
        assert_eq!(parse_intent("scale replicas 3"), Intent::ScaleReplicas(3));
        assert_eq!(parse_intent("rollback"), Intent::Rollback);
        assert_eq!(parse_intent("resolve"), Intent::Resolve);
        assert_eq!(parse_intent("help"), Intent::Help);
        assert_eq!(parse_intent("what is going on?"), Intent::Unknown);
        assert_eq!(parse_intent("scale memory lots"), Intent::Unknown);
    }

    fn manager(db: &Database) -> Arc<ConversationManager> {
        ConversationManager::new(
            db.clone(),
            Arc::new(Broker::new()),
            Arc::new(RailwayClient::new(None, 50, 10_000)),
            Arc::new(AnalystRegistry::new(&LlmConfig::default())),
            Telemetry::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_session_reuse_and_message_ordering() {
        let db = Database::open_in_memory().unwrap();
        let manager = manager(&db);

        manager.handle_message("C1:100.1", "U1", "help").await.unwrap();
        manager.handle_message("C1:100.1", "U1", "status").await.unwrap();

        let session = db.get_session_by_ref("chat", "C1:100.1").unwrap();
        let messages = db.list_messages(&session.id).unwrap();
        // system + 2 * (user + assistant)
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, MessageRole::System);
        for pair in messages.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_help_reply_without_llm() {
        let db = Database::open_in_memory().unwrap();
        let manager = manager(&db);
        let reply = manager.handle_message("C1:1", "U1", "help").await.unwrap();
        assert!(reply.contains("scale memory"));
    }

    #[tokio::test]
    async fn test_resolve_closes_session() {
        let db = Database::open_in_memory().unwrap();
        let manager = manager(&db);
        manager.handle_message("C1:1", "U1", "resolve").await.unwrap();
        let session = db.get_session_by_ref("chat", "C1:1").unwrap();
        assert!(session.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_mutating_intent_publishes_auto_fix() {
        let db = Database::open_in_memory().unwrap();
        let broker = Arc::new(Broker::new());
        let mut requests = broker.subscribe(topics::REMEDIATION_ACTIONS);
        let manager = ConversationManager::new(
            db.clone(),
            broker.clone(),
            Arc::new(RailwayClient::new(None, 50, 10_000)),
            Arc::new(AnalystRegistry::new(&LlmConfig::default())),
            Telemetry::new(),
            None,
        );

        let incident = db
            .upsert_incident(&crate::db::IncidentCandidate {
                service_id: "svc-1".into(),
                service_name: "api".into(),
                environment_id: Some("env-1".into()),
                fingerprint: "fp".into(),
                severity: crate::db::Severity::High,
                confidence: 0.9,
                root_cause: None,
                recommended_action: RecommendedAction::Restart,
                reasoning: None,
                log_context: serde_json::json!({}),
                metadata: serde_json::json!({}),
            })
            .unwrap()
            .incident()
            .clone();

        // Anchor the session to the incident, then ask for a restart.
        manager
            .open_session("C1:1", "U1", Some(&incident.id))
            .unwrap();
        let reply = manager.handle_message("C1:1", "U1", "restart").await.unwrap();
        assert!(reply.contains("restart"));

        let event = requests.try_recv().unwrap();
        assert!(matches!(
            event,
            PipelineEvent::AutoFixRequested { initiator: InitiatorType::User, action: Some(RecommendedAction::Restart), .. }
        ));
    }

    #[test]
    fn test_slash_channel_ref_shape() {
        assert_eq!(slash_channel_ref("C9", "U7"), "C9:slash:U7");
    }
}
