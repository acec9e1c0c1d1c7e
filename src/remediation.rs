//! Remediation coordinator
//!
//! Listens for auto-fix requests, validates policy and the at-most-one
//! invariant, drives the platform client, and records the outcome on both
//! the action row and the incident. Failures never crash the task; they
//! become terminal action states and user-visible messages.

use crate::broker::Broker;
use crate::config::Config;
use crate::db::{
    ActionStatus, ActionType, Database, DbError, Incident, IncidentStatus, InitiatorType,
    RecommendedAction, ServicePolicy,
};
use crate::events::{topics, PipelineEvent};
use crate::railway::{ClientError, RailwayClient};
use crate::telemetry::Telemetry;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Non-terminal actions older than this are re-evaluated on startup.
const STALE_ACTION_AGE_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("platform error: {0}")]
    Client(#[from] ClientError),
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("{0} is not supported for this service")]
    Unsupported(&'static str),
    #[error("incident has no environment id; cannot target the platform")]
    MissingEnvironment,
}

/// Coordinator task
pub struct RemediationCoordinator {
    db: Database,
    broker: Arc<Broker>,
    railway: Arc<RailwayClient>,
    telemetry: Arc<Telemetry>,
    /// Project scope for deployment queries (rollback target resolution)
    default_project: Option<String>,
    shutting_down: watch::Receiver<bool>,
}

impl RemediationCoordinator {
    pub fn new(
        db: Database,
        broker: Arc<Broker>,
        railway: Arc<RailwayClient>,
        telemetry: Arc<Telemetry>,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            broker,
            railway,
            telemetry,
            default_project: config.railway.projects.first().cloned(),
            shutting_down: shutdown,
        }
    }

    pub async fn run(self) {
        // Re-evaluate anything a previous process left in flight.
        self.recover_stale_actions().await;

        let mut requests = self.broker.subscribe(topics::REMEDIATION_ACTIONS);
        let mut shutdown = self.shutting_down.clone();
        loop {
            tokio::select! {
                event = requests.recv() => match event {
                    Ok(PipelineEvent::AutoFixRequested { incident_id, initiator, initiator_ref, action, parameters }) => {
                        // Refuse new work while shutting down; in-flight
                        // dispatches below run to completion.
                        if *shutdown.borrow() {
                            continue;
                        }
                        self.handle_request(
                            &incident_id,
                            initiator,
                            initiator_ref.as_deref(),
                            action,
                            parameters,
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "coordinator lagged on remediation topic");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("remediation coordinator stopped");
    }

    /// Process one auto-fix request end to end.
    pub async fn handle_request(
        &self,
        incident_id: &str,
        initiator: InitiatorType,
        initiator_ref: Option<&str>,
        action_override: Option<RecommendedAction>,
        request_parameters: Option<serde_json::Value>,
    ) {
        let incident = match self.db.get_incident(incident_id) {
            Ok(incident) => incident,
            Err(e) => {
                tracing::warn!(incident_id, error = %e, "auto-fix request for unknown incident");
                return;
            }
        };

        if incident.status.is_terminal() {
            self.skip(incident_id, "This incident is already resolved.");
            return;
        }

        let policy = match self.db.get_policy(&incident.service_id) {
            Ok(policy) => policy,
            Err(e) => {
                tracing::error!(error = %e, "policy load failed");
                self.telemetry.record_error("coordinator", "policy");
                return;
            }
        };

        if initiator == InitiatorType::Automated {
            if let Err(reason) = automated_gate(&policy, incident.confidence) {
                tracing::info!(incident_id, %reason, "automated remediation gated off");
                self.skip(incident_id, &reason);
                return;
            }
        }

        let action_type =
            ActionType::from_recommendation(action_override.unwrap_or(incident.recommended_action));
        let mut parameters = json!({
            "initiator_ref": initiator_ref,
            "correlation_id": uuid::Uuid::new_v4().to_string(),
        });
        if let Some(requested) = &request_parameters {
            if let (Some(target), Some(source)) =
                (parameters.as_object_mut(), requested.as_object())
            {
                for (key, value) in source {
                    target.insert(key.clone(), value.clone());
                }
            }
        }

        let action = match self.db.create_action(
            incident_id,
            initiator,
            initiator_ref,
            action_type,
            parameters,
        ) {
            Ok(action) => action,
            Err(DbError::ConcurrentActionInProgress(_)) => {
                self.skip(
                    incident_id,
                    "A remediation for this incident is already in flight.",
                );
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "action creation failed");
                self.telemetry.record_error("coordinator", "action_create");
                return;
            }
        };

        if let Err(e) = self.db.start_action(&action.id) {
            tracing::error!(error = %e, "action start failed");
            return;
        }
        if incident.status == IncidentStatus::Detected {
            if let Err(e) = self
                .db
                .transition_incident(incident_id, IncidentStatus::AwaitingAction)
            {
                tracing::warn!(error = %e, "incident did not enter awaiting_action");
            }
        }

        let result = self
            .dispatch(&incident, &policy, action_type, request_parameters.as_ref())
            .await;
        let requested_at = action.requested_at;

        match result {
            Ok(message) => {
                if let Err(e) = self.db.complete_action(&action.id, Some(&message), None) {
                    tracing::error!(error = %e, "action completion failed");
                }
                if let Err(e) = self
                    .db
                    .transition_incident(incident_id, IncidentStatus::AutoRemediated)
                {
                    tracing::warn!(error = %e, "incident did not close after success");
                }
                let latency = (Utc::now() - requested_at).to_std().unwrap_or_default();
                self.telemetry.record_remediation_latency(latency);
                tracing::info!(
                    incident_id,
                    action_id = %action.id,
                    action = %action_type,
                    latency_ms = %latency.as_millis(),
                    "remediation succeeded"
                );
                self.broker.publish(
                    topics::REMEDIATION_ACTIONS,
                    PipelineEvent::RemediationCompleted {
                        incident_id: incident_id.to_string(),
                        action_id: action.id,
                        success: true,
                        message,
                    },
                );
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(db_err) = self.db.complete_action(&action.id, None, Some(&reason)) {
                    tracing::error!(error = %db_err, "action failure record failed");
                }
                if let Err(db_err) = self
                    .db
                    .transition_incident(incident_id, IncidentStatus::Failed)
                {
                    tracing::warn!(error = %db_err, "incident did not enter failed");
                }
                self.telemetry.record_error("coordinator", "dispatch");
                tracing::error!(
                    incident_id,
                    action = %action_type,
                    error = %reason,
                    "remediation failed"
                );
                self.broker.publish(
                    topics::REMEDIATION_ACTIONS,
                    PipelineEvent::RemediationCompleted {
                        incident_id: incident_id.to_string(),
                        action_id: action.id,
                        success: false,
                        message: reason,
                    },
                );
            }
        }
    }

    /// Issue the platform RPC for the chosen action.
    async fn dispatch(
        &self,
        incident: &Incident,
        policy: &ServicePolicy,
        action_type: ActionType,
        parameters: Option<&serde_json::Value>,
    ) -> Result<String, RemediationError> {
        // Diagnostic, manual-fix, and none have no platform side effect.
        if !action_type.has_side_effect() {
            return Ok("no action".to_string());
        }

        let environment_id = incident
            .environment_id
            .as_deref()
            .ok_or(RemediationError::MissingEnvironment)?;
        let service_id = &incident.service_id;

        match action_type {
            ActionType::Restart => {
                let deployment = self
                    .railway
                    .latest_deployment_id(environment_id, service_id)
                    .await?;
                self.railway.restart_deployment(&deployment).await?;
                Ok(format!("restarted deployment {deployment}"))
            }
            ActionType::Redeploy => {
                self.railway
                    .redeploy_service(environment_id, service_id)
                    .await?;
                Ok("redeploy triggered".to_string())
            }
            ActionType::ScaleMemory => {
                // Explicit request parameter wins over the policy default.
                let memory_mb = parameters
                    .and_then(|p| p.get("memory_mb"))
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|mb| u32::try_from(mb).ok())
                    .or_else(|| {
                        policy
                            .default_memory_mb
                            .and_then(|mb| u32::try_from(mb).ok())
                    })
                    .ok_or(RemediationError::Unsupported(
                        "scale_memory without a memory target",
                    ))?;
                self.railway
                    .update_service_limits(environment_id, service_id, memory_mb)
                    .await?;
                Ok(format!("memory limit set to {memory_mb} MB"))
            }
            ActionType::ScaleReplicas => {
                let replicas = parameters
                    .and_then(|p| p.get("num_replicas"))
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .or_else(|| {
                        policy
                            .default_replicas
                            .and_then(|n| u32::try_from(n).ok())
                    })
                    .ok_or(RemediationError::Unsupported(
                        "scale_replicas without a replica target",
                    ))?;
                self.railway
                    .update_service_instance(environment_id, service_id, replicas)
                    .await?;
                Ok(format!("replica count set to {replicas}"))
            }
            ActionType::Rollback => {
                let project = self.default_project.as_deref().ok_or(
                    RemediationError::Unsupported("rollback without a configured project"),
                )?;
                let previous = self
                    .railway
                    .previous_deployment_id(project, environment_id, service_id)
                    .await?;
                self.railway.rollback_deployment(&previous).await?;
                Ok(format!("rolled back to deployment {previous}"))
            }
            ActionType::Stop => {
                let deployment = self
                    .railway
                    .latest_deployment_id(environment_id, service_id)
                    .await?;
                self.railway.stop_deployment(&deployment).await?;
                Ok(format!("stopped deployment {deployment}"))
            }
            ActionType::Diagnostic | ActionType::ManualFix | ActionType::None => {
                unreachable!("side-effect-free actions return before dispatch")
            }
        }
    }

    fn skip(&self, incident_id: &str, reason: &str) {
        self.broker.publish(
            topics::REMEDIATION_ACTIONS,
            PipelineEvent::RemediationSkipped {
                incident_id: incident_id.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    /// Startup idempotence: non-terminal actions without a completion
    /// inside the staleness threshold are resolved against the platform's
    /// real deployment state instead of being blindly re-issued.
    async fn recover_stale_actions(&self) {
        let cutoff = Utc::now() - ChronoDuration::minutes(STALE_ACTION_AGE_MINUTES);
        let stale = match self.db.list_stale_actions(cutoff) {
            Ok(stale) => stale,
            Err(e) => {
                tracing::error!(error = %e, "stale action query failed");
                return;
            }
        };
        for action in stale {
            let incident = match self.db.get_incident(&action.incident_id) {
                Ok(incident) => incident,
                Err(_) => continue,
            };
            let verdict = self.probe_deployment_state(&incident).await;
            match verdict {
                Ok(true) => {
                    tracing::info!(action_id = %action.id, "stale action found completed on platform");
                    let _ = self.db.complete_action(
                        &action.id,
                        Some("verified complete after restart"),
                        None,
                    );
                    if incident.status == IncidentStatus::AwaitingAction {
                        let _ = self
                            .db
                            .transition_incident(&incident.id, IncidentStatus::AutoRemediated);
                    }
                }
                Ok(false) | Err(_) => {
                    tracing::warn!(action_id = %action.id, "stale action expired");
                    let _ = self.db.complete_action(
                        &action.id,
                        None,
                        Some("expired before completion; process restarted"),
                    );
                    if incident.status == IncidentStatus::AwaitingAction {
                        let _ = self
                            .db
                            .transition_incident(&incident.id, IncidentStatus::Failed);
                    }
                }
            }
        }
    }

    /// Whether the incident's service currently has a successful latest
    /// deployment in its environment.
    async fn probe_deployment_state(&self, incident: &Incident) -> Result<bool, ClientError> {
        let Some(environment_id) = incident.environment_id.as_deref() else {
            return Ok(false);
        };
        let service = self.railway.service(&incident.service_id).await?;
        Ok(service
            .instances
            .iter()
            .filter(|i| i.environment_id == environment_id)
            .filter_map(|i| i.latest_deployment.as_ref())
            .any(|d| {
                d.status
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case("success"))
            }))
    }
}

/// Gate for policy-initiated requests: the service must opt in and the
/// incident confidence must clear the policy threshold.
fn automated_gate(policy: &ServicePolicy, confidence: f64) -> Result<(), String> {
    if !policy.auto_remediation_enabled {
        return Err(format!(
            "Auto-remediation is disabled for {}.",
            policy.service_name
        ));
    }
    if confidence < policy.confidence_threshold {
        return Err(format!(
            "Confidence {:.0}% is below the {:.0}% threshold for {}.",
            confidence * 100.0,
            policy.confidence_threshold * 100.0,
            policy.service_name
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PerformanceConfig, RailwayConfig, RunMode, SlackConfig};
    use crate::db::{IncidentCandidate, Severity};

    fn test_config() -> Config {
        Config {
            mode: RunMode::Development,
            port: 0,
            db_path: ":memory:".into(),
            railway: RailwayConfig {
                api_token: None,
                projects: vec!["proj-1".into()],
                environments: vec!["production".into()],
                services: vec![],
            },
            slack: SlackConfig::default(),
            llm: crate::config::LlmConfig::default(),
            perf: PerformanceConfig::default(),
        }
    }

    fn coordinator(db: &Database, broker: &Arc<Broker>) -> RemediationCoordinator {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        RemediationCoordinator::new(
            db.clone(),
            broker.clone(),
            Arc::new(RailwayClient::new(None, 50, 10_000)),
            Telemetry::new(),
            &test_config(),
            rx,
        )
    }

    fn seed_incident(db: &Database, action: RecommendedAction) -> Incident {
        db.upsert_incident(&IncidentCandidate {
            service_id: "svc-1".into(),
            service_name: "api".into(),
            environment_id: Some("env-1".into()),
            fingerprint: "fp-1".into(),
            severity: Severity::High,
            confidence: 0.9,
            root_cause: Some("oom".into()),
            recommended_action: action,
            reasoning: None,
            log_context: json!({}),
            metadata: json!({}),
        })
        .unwrap()
        .incident()
        .clone()
    }

    #[test]
    fn test_automated_gate() {
        let mut policy = ServicePolicy {
            id: "p".into(),
            service_id: "svc-1".into(),
            service_name: "api".into(),
            auto_remediation_enabled: false,
            default_memory_mb: None,
            default_replicas: None,
            llm_provider: "auto".into(),
            confidence_threshold: 0.8,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(automated_gate(&policy, 0.9).is_err());
        policy.auto_remediation_enabled = true;
        assert!(automated_gate(&policy, 0.9).is_ok());
        assert!(automated_gate(&policy, 0.7).is_err());
    }

    #[tokio::test]
    async fn test_no_action_type_succeeds_without_platform() {
        let db = Database::open_in_memory().unwrap();
        let broker = Arc::new(Broker::new());
        let coordinator = coordinator(&db, &broker);
        let incident = seed_incident(&db, RecommendedAction::ManualFix);

        coordinator
            .handle_request(&incident.id, InitiatorType::User, Some("U1"), None, None)
            .await;

        let actions = db.list_actions(&incident.id).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].status, ActionStatus::Succeeded);
        assert_eq!(actions[0].result_message.as_deref(), Some("no action"));
        let incident = db.get_incident(&incident.id).unwrap();
        assert_eq!(incident.status, IncidentStatus::AutoRemediated);
        assert!(incident.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_unconfigured_platform_fails_the_action() {
        let db = Database::open_in_memory().unwrap();
        let broker = Arc::new(Broker::new());
        let coordinator = coordinator(&db, &broker);
        let incident = seed_incident(&db, RecommendedAction::Restart);

        coordinator
            .handle_request(&incident.id, InitiatorType::User, Some("U1"), None, None)
            .await;

        let actions = db.list_actions(&incident.id).unwrap();
        assert_eq!(actions[0].status, ActionStatus::Failed);
        assert!(actions[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("not configured"));
        assert_eq!(
            db.get_incident(&incident.id).unwrap().status,
            IncidentStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_terminal_incident_is_skipped() {
        let db = Database::open_in_memory().unwrap();
        let broker = Arc::new(Broker::new());
        let mut skips = broker.subscribe(topics::REMEDIATION_ACTIONS);
        let coordinator = coordinator(&db, &broker);
        let incident = seed_incident(&db, RecommendedAction::Restart);
        db.transition_incident(&incident.id, IncidentStatus::ManualResolved)
            .unwrap();

        coordinator
            .handle_request(&incident.id, InitiatorType::User, None, None, None)
            .await;

        assert!(db.list_actions(&incident.id).unwrap().is_empty());
        let event = skips.try_recv().unwrap();
        assert!(matches!(
            event,
            PipelineEvent::RemediationSkipped { reason, .. } if reason.contains("already resolved")
        ));
    }

    #[tokio::test]
    async fn test_automated_request_gated_by_policy() {
        let db = Database::open_in_memory().unwrap();
        let broker = Arc::new(Broker::new());
        let coordinator = coordinator(&db, &broker);
        let incident = seed_incident(&db, RecommendedAction::ManualFix);
        // Default policy has auto remediation disabled.
        db.ensure_policy("svc-1", "api").unwrap();

        coordinator
            .handle_request(&incident.id, InitiatorType::Automated, None, None, None)
            .await;

        assert!(db.list_actions(&incident.id).unwrap().is_empty());
        assert_eq!(
            db.get_incident(&incident.id).unwrap().status,
            IncidentStatus::Detected
        );
    }
}
