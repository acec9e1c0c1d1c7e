//! Database module
//!
//! Provides persistence for incidents, remediation actions, conversation
//! sessions, and service policies. The incident upsert is the write path
//! the detector races on; it is serialized by the `(service_id, fingerprint)`
//! unique index plus read-modify-write inside a transaction.

mod schema;

pub use schema::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Incident not found: {0}")]
    IncidentNotFound(String),
    #[error("Remediation action not found: {0}")]
    ActionNotFound(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error("Incident {0} already has a remediation in flight")]
    ConcurrentActionInProgress(String),
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Outcome of an incident upsert
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    /// A new incident row was inserted
    Created(Incident),
    /// An existing open incident was refreshed
    Updated(Incident),
    /// The incident is terminal; nothing was written
    Skipped(Incident),
}

impl UpsertOutcome {
    pub fn incident(&self) -> &Incident {
        match self {
            UpsertOutcome::Created(i) | UpsertOutcome::Updated(i) | UpsertOutcome::Skipped(i) => i,
        }
    }

    /// Whether downstream fan-out should fire for this outcome.
    pub fn should_publish(&self) -> bool {
        !matches!(self, UpsertOutcome::Skipped(_))
    }
}

/// Fields the detector supplies for each incident candidate
#[derive(Debug, Clone)]
pub struct IncidentCandidate {
    pub service_id: String,
    pub service_name: String,
    pub environment_id: Option<String>,
    pub fingerprint: String,
    pub severity: Severity,
    pub confidence: f64,
    pub root_cause: Option<String>,
    pub recommended_action: RecommendedAction,
    pub reasoning: Option<String>,
    pub log_context: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({}))
}

impl Database {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> DbResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Liveness probe for the health endpoint
    pub fn health_check(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ==================== Incidents ====================

    /// Deduplicating upsert keyed by `(service_id, fingerprint)`.
    ///
    /// Open incidents (`detected`, `awaiting_action`, `failed`) are refreshed
    /// with the candidate's mutable fields; `failed` reopens to `detected`.
    /// Terminal incidents are returned untouched as `Skipped`.
    pub fn upsert_incident(&self, candidate: &IncidentCandidate) -> DbResult<UpsertOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let existing = Self::find_by_fingerprint_tx(&tx, &candidate.service_id, &candidate.fingerprint)?;

        let outcome = match existing {
            None => {
                let incident = Incident {
                    id: Uuid::new_v4().to_string(),
                    service_id: candidate.service_id.clone(),
                    service_name: candidate.service_name.clone(),
                    environment_id: candidate.environment_id.clone(),
                    fingerprint: candidate.fingerprint.clone(),
                    severity: candidate.severity,
                    status: IncidentStatus::Detected,
                    confidence: candidate.confidence,
                    root_cause: candidate.root_cause.clone(),
                    recommended_action: candidate.recommended_action,
                    reasoning: candidate.reasoning.clone(),
                    log_context: candidate.log_context.clone(),
                    detected_at: Utc::now(),
                    resolved_at: None,
                    metadata: candidate.metadata.clone(),
                };
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO incidents
                     (id, service_id, service_name, environment_id, fingerprint, severity, status,
                      confidence, root_cause, recommended_action, reasoning, log_context,
                      detected_at, resolved_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL, ?14)",
                    params![
                        incident.id,
                        incident.service_id,
                        incident.service_name,
                        incident.environment_id,
                        incident.fingerprint,
                        incident.severity.as_str(),
                        incident.status.as_str(),
                        incident.confidence,
                        incident.root_cause,
                        incident.recommended_action.as_str(),
                        incident.reasoning,
                        incident.log_context.to_string(),
                        incident.detected_at.to_rfc3339(),
                        incident.metadata.to_string(),
                    ],
                )?;
                if inserted == 0 {
                    // Lost the insert race; the row now exists, fall through
                    // to the update path on the row the winner created.
                    let row = Self::find_by_fingerprint_tx(
                        &tx,
                        &candidate.service_id,
                        &candidate.fingerprint,
                    )?
                    .ok_or_else(|| {
                        DbError::CorruptRow(format!(
                            "unique race on ({}, {}) left no row",
                            candidate.service_id, candidate.fingerprint
                        ))
                    })?;
                    Self::refresh_incident_tx(&tx, &row, candidate)?
                } else {
                    UpsertOutcome::Created(incident)
                }
            }
            Some(row) => Self::refresh_incident_tx(&tx, &row, candidate)?,
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn refresh_incident_tx(
        tx: &rusqlite::Transaction<'_>,
        row: &Incident,
        candidate: &IncidentCandidate,
    ) -> DbResult<UpsertOutcome> {
        if row.status.is_terminal() {
            return Ok(UpsertOutcome::Skipped(row.clone()));
        }

        // A fresh signal reopens a failed incident.
        let status = if row.status == IncidentStatus::Failed {
            IncidentStatus::Detected
        } else {
            row.status
        };

        tx.execute(
            "UPDATE incidents
             SET severity = ?1, confidence = ?2, root_cause = ?3, recommended_action = ?4,
                 reasoning = ?5, log_context = ?6, metadata = ?7, status = ?8
             WHERE id = ?9",
            params![
                candidate.severity.as_str(),
                candidate.confidence,
                candidate.root_cause,
                candidate.recommended_action.as_str(),
                candidate.reasoning,
                candidate.log_context.to_string(),
                candidate.metadata.to_string(),
                status.as_str(),
                row.id,
            ],
        )?;

        let mut updated = row.clone();
        updated.severity = candidate.severity;
        updated.confidence = candidate.confidence;
        updated.root_cause = candidate.root_cause.clone();
        updated.recommended_action = candidate.recommended_action;
        updated.reasoning = candidate.reasoning.clone();
        updated.log_context = candidate.log_context.clone();
        updated.metadata = candidate.metadata.clone();
        updated.status = status;
        Ok(UpsertOutcome::Updated(updated))
    }

    fn find_by_fingerprint_tx(
        tx: &rusqlite::Transaction<'_>,
        service_id: &str,
        fingerprint: &str,
    ) -> DbResult<Option<Incident>> {
        let mut stmt = tx.prepare(
            "SELECT id, service_id, service_name, environment_id, fingerprint, severity, status,
                    confidence, root_cause, recommended_action, reasoning, log_context,
                    detected_at, resolved_at, metadata
             FROM incidents WHERE service_id = ?1 AND fingerprint = ?2",
        )?;
        let row = stmt
            .query_row(params![service_id, fingerprint], Self::incident_from_row)
            .optional()?;
        Ok(row)
    }

    #[allow(clippy::needless_pass_by_value)]
    fn incident_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
        let severity: String = row.get(5)?;
        let status: String = row.get(6)?;
        let action: String = row.get(9)?;
        Ok(Incident {
            id: row.get(0)?,
            service_id: row.get(1)?,
            service_name: row.get(2)?,
            environment_id: row.get(3)?,
            fingerprint: row.get(4)?,
            severity: Severity::parse(&severity).unwrap_or(Severity::Low),
            status: IncidentStatus::parse(&status).unwrap_or(IncidentStatus::Detected),
            confidence: row.get(7)?,
            root_cause: row.get(8)?,
            recommended_action: RecommendedAction::parse(&action).unwrap_or_default(),
            reasoning: row.get(10)?,
            log_context: parse_json(&row.get::<_, String>(11)?),
            detected_at: parse_datetime(&row.get::<_, String>(12)?),
            resolved_at: row.get::<_, Option<String>>(13)?.map(|s| parse_datetime(&s)),
            metadata: parse_json(&row.get::<_, String>(14)?),
        })
    }

    const INCIDENT_COLUMNS: &'static str =
        "id, service_id, service_name, environment_id, fingerprint, severity, status,
         confidence, root_cause, recommended_action, reasoning, log_context,
         detected_at, resolved_at, metadata";

    /// Get an incident by ID
    pub fn get_incident(&self, id: &str) -> DbResult<Incident> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incidents WHERE id = ?1",
            Self::INCIDENT_COLUMNS
        ))?;
        stmt.query_row(params![id], Self::incident_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::IncidentNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    /// Recent incidents, newest first
    pub fn list_recent_incidents(&self, limit: u32) -> DbResult<Vec<Incident>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incidents ORDER BY detected_at DESC LIMIT ?1",
            Self::INCIDENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit], Self::incident_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Caller-driven status transition; rejects moves the lifecycle forbids.
    /// Terminal transitions stamp `resolved_at`.
    pub fn transition_incident(&self, id: &str, next: IncidentStatus) -> DbResult<Incident> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut incident = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM incidents WHERE id = ?1",
                Self::INCIDENT_COLUMNS
            ))?;
            stmt.query_row(params![id], Self::incident_from_row)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        DbError::IncidentNotFound(id.to_string())
                    }
                    other => DbError::Sqlite(other),
                })?
        };

        if !incident.status.can_transition_to(next) {
            return Err(DbError::InvalidStatusTransition {
                from: incident.status,
                to: next,
            });
        }

        let resolved_at = if next.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };

        tx.execute(
            "UPDATE incidents SET status = ?1, resolved_at = ?2 WHERE id = ?3",
            params![
                next.as_str(),
                resolved_at.map(|t| t.to_rfc3339()),
                id
            ],
        )?;
        tx.commit()?;

        incident.status = next;
        incident.resolved_at = resolved_at;
        Ok(incident)
    }

    /// Incident counts grouped by status, for telemetry and health
    pub fn count_incidents_by_status(&self) -> DbResult<Vec<(IncidentStatus, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM incidents GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = IncidentStatus::parse(&status) {
                counts.push((status, count));
            }
        }
        Ok(counts)
    }

    // ==================== Remediation actions ====================

    /// Create a pending remediation action.
    ///
    /// Enforces the at-most-one invariant: an incident with a `pending` or
    /// `in_progress` action rejects further creation.
    pub fn create_action(
        &self,
        incident_id: &str,
        initiator_type: InitiatorType,
        initiator_ref: Option<&str>,
        action_type: ActionType,
        parameters: serde_json::Value,
    ) -> DbResult<RemediationAction> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let open: i64 = tx.query_row(
            "SELECT COUNT(*) FROM remediation_actions
             WHERE incident_id = ?1 AND status IN ('pending', 'in_progress')",
            params![incident_id],
            |row| row.get(0),
        )?;
        if open > 0 {
            return Err(DbError::ConcurrentActionInProgress(incident_id.to_string()));
        }

        let action = RemediationAction {
            id: Uuid::new_v4().to_string(),
            incident_id: incident_id.to_string(),
            initiator_type,
            initiator_ref: initiator_ref.map(String::from),
            action_type,
            parameters,
            requested_at: Utc::now(),
            completed_at: None,
            status: ActionStatus::Pending,
            result_message: None,
            failure_reason: None,
        };

        tx.execute(
            "INSERT INTO remediation_actions
             (id, incident_id, initiator_type, initiator_ref, action_type, parameters,
              requested_at, completed_at, status, result_message, failure_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, NULL, NULL)",
            params![
                action.id,
                action.incident_id,
                action.initiator_type.as_str(),
                action.initiator_ref,
                action.action_type.as_str(),
                action.parameters.to_string(),
                action.requested_at.to_rfc3339(),
                action.status.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(action)
    }

    /// Move an action to `in_progress`
    pub fn start_action(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE remediation_actions SET status = 'in_progress' WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        if changed == 0 {
            return Err(DbError::ActionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Terminal completion; `failure_reason` marks the action failed.
    pub fn complete_action(
        &self,
        id: &str,
        result_message: Option<&str>,
        failure_reason: Option<&str>,
    ) -> DbResult<()> {
        let status = if failure_reason.is_some() {
            ActionStatus::Failed
        } else {
            ActionStatus::Succeeded
        };
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE remediation_actions
             SET status = ?1, completed_at = ?2, result_message = ?3, failure_reason = ?4
             WHERE id = ?5",
            params![
                status.as_str(),
                Utc::now().to_rfc3339(),
                result_message,
                failure_reason,
                id
            ],
        )?;
        if changed == 0 {
            return Err(DbError::ActionNotFound(id.to_string()));
        }
        Ok(())
    }

    fn action_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemediationAction> {
        let initiator: String = row.get(2)?;
        let action_type: String = row.get(4)?;
        let status: String = row.get(8)?;
        Ok(RemediationAction {
            id: row.get(0)?,
            incident_id: row.get(1)?,
            initiator_type: InitiatorType::parse(&initiator).unwrap_or(InitiatorType::Automated),
            initiator_ref: row.get(3)?,
            action_type: ActionType::parse(&action_type).unwrap_or_default(),
            parameters: parse_json(&row.get::<_, String>(5)?),
            requested_at: parse_datetime(&row.get::<_, String>(6)?),
            completed_at: row.get::<_, Option<String>>(7)?.map(|s| parse_datetime(&s)),
            status: ActionStatus::parse(&status).unwrap_or(ActionStatus::Pending),
            result_message: row.get(9)?,
            failure_reason: row.get(10)?,
        })
    }

    const ACTION_COLUMNS: &'static str =
        "id, incident_id, initiator_type, initiator_ref, action_type, parameters,
         requested_at, completed_at, status, result_message, failure_reason";

    /// Actions for an incident, oldest first
    pub fn list_actions(&self, incident_id: &str) -> DbResult<Vec<RemediationAction>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM remediation_actions WHERE incident_id = ?1 ORDER BY requested_at",
            Self::ACTION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![incident_id], Self::action_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Non-terminal actions requested before `cutoff` (startup re-evaluation)
    pub fn list_stale_actions(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<RemediationAction>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM remediation_actions
             WHERE status IN ('pending', 'in_progress') AND requested_at < ?1",
            Self::ACTION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], Self::action_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Action counts grouped by terminal outcome
    pub fn count_actions_by_status(&self) -> DbResult<Vec<(ActionStatus, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM remediation_actions GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = ActionStatus::parse(&status) {
                counts.push((status, count));
            }
        }
        Ok(counts)
    }

    // ==================== Service policies ====================

    /// Fetch the policy for a service, creating the default row on first
    /// observation.
    pub fn ensure_policy(&self, service_id: &str, service_name: &str) -> DbResult<ServicePolicy> {
        {
            let conn = self.conn.lock().unwrap();
            let now = Utc::now();
            conn.execute(
                "INSERT OR IGNORE INTO service_policies
                 (id, service_id, service_name, auto_remediation_enabled, llm_provider,
                  confidence_threshold, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, 'auto', 0.8, ?4, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    service_id,
                    service_name,
                    now.to_rfc3339()
                ],
            )?;
        }
        self.get_policy(service_id)
    }

    /// Fetch a policy; absent services fall back to conservative defaults
    /// without writing a row.
    pub fn get_policy(&self, service_id: &str) -> DbResult<ServicePolicy> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, service_id, service_name, auto_remediation_enabled, default_memory_mb,
                    default_replicas, llm_provider, confidence_threshold, created_at, updated_at
             FROM service_policies WHERE service_id = ?1",
        )?;
        let policy = stmt
            .query_row(params![service_id], |row| {
                Ok(ServicePolicy {
                    id: row.get(0)?,
                    service_id: row.get(1)?,
                    service_name: row.get(2)?,
                    auto_remediation_enabled: row.get(3)?,
                    default_memory_mb: row.get(4)?,
                    default_replicas: row.get(5)?,
                    llm_provider: row.get(6)?,
                    confidence_threshold: row.get(7)?,
                    created_at: parse_datetime(&row.get::<_, String>(8)?),
                    updated_at: parse_datetime(&row.get::<_, String>(9)?),
                })
            })
            .optional()?;

        Ok(policy.unwrap_or_else(|| {
            let now = Utc::now();
            ServicePolicy {
                id: String::new(),
                service_id: service_id.to_string(),
                service_name: service_id.to_string(),
                auto_remediation_enabled: false,
                default_memory_mb: None,
                default_replicas: None,
                llm_provider: "auto".to_string(),
                confidence_threshold: 0.8,
                created_at: now,
                updated_at: now,
            }
        }))
    }

    /// Update a policy's remediation gate and threshold
    pub fn update_policy(
        &self,
        service_id: &str,
        auto_remediation_enabled: bool,
        confidence_threshold: f64,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE service_policies
             SET auto_remediation_enabled = ?1, confidence_threshold = ?2, updated_at = ?3
             WHERE service_id = ?4",
            params![
                auto_remediation_enabled,
                confidence_threshold,
                Utc::now().to_rfc3339(),
                service_id
            ],
        )?;
        Ok(())
    }

    // ==================== Conversation sessions ====================

    /// Find or create a session keyed by `(channel, channel_ref)`.
    /// Thread reuse returns the existing session.
    pub fn find_or_create_session(
        &self,
        channel: &str,
        channel_ref: &str,
        participant_id: &str,
        incident_id: Option<&str>,
    ) -> DbResult<ConversationSession> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO conversation_sessions
                 (id, incident_id, channel, channel_ref, participant_id, started_at, context)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{}')",
                params![
                    Uuid::new_v4().to_string(),
                    incident_id,
                    channel,
                    channel_ref,
                    participant_id,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        self.get_session_by_ref(channel, channel_ref)
    }

    fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSession> {
        Ok(ConversationSession {
            id: row.get(0)?,
            incident_id: row.get(1)?,
            channel: row.get(2)?,
            channel_ref: row.get(3)?,
            participant_id: row.get(4)?,
            started_at: parse_datetime(&row.get::<_, String>(5)?),
            closed_at: row.get::<_, Option<String>>(6)?.map(|s| parse_datetime(&s)),
            context: parse_json(&row.get::<_, String>(7)?),
        })
    }

    const SESSION_COLUMNS: &'static str =
        "id, incident_id, channel, channel_ref, participant_id, started_at, closed_at, context";

    /// Look up a session by its thread identity
    pub fn get_session_by_ref(
        &self,
        channel: &str,
        channel_ref: &str,
    ) -> DbResult<ConversationSession> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversation_sessions WHERE channel = ?1 AND channel_ref = ?2",
            Self::SESSION_COLUMNS
        ))?;
        stmt.query_row(params![channel, channel_ref], Self::session_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::SessionNotFound(format!("{channel}:{channel_ref}"))
                }
                other => DbError::Sqlite(other),
            })
    }

    /// Close a session. `closed_at` is written exactly once; closing a
    /// closed session is a no-op.
    pub fn close_session(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE conversation_sessions SET closed_at = ?1 WHERE id = ?2 AND closed_at IS NULL",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Open sessions whose last message predates `cutoff` (idle close sweep)
    pub fn list_idle_sessions(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<ConversationSession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversation_sessions s
             WHERE s.closed_at IS NULL
               AND COALESCE(
                     (SELECT MAX(m.timestamp) FROM conversation_messages m WHERE m.session_id = s.id),
                     s.started_at
                   ) < ?1",
            Self::SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], Self::session_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Append a message to a session
    pub fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        action_ref: Option<&str>,
    ) -> DbResult<ConversationMessage> {
        let message = ConversationMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            action_ref: action_ref.map(String::from),
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_messages (id, session_id, role, content, timestamp, action_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.session_id,
                message.role.as_str(),
                message.content,
                message.timestamp.to_rfc3339(),
                message.action_ref
            ],
        )?;
        Ok(message)
    }

    /// Messages for a session in timestamp order
    pub fn list_messages(&self, session_id: &str) -> DbResult<Vec<ConversationMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, timestamp, action_ref
             FROM conversation_messages WHERE session_id = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let role: String = row.get(2)?;
            Ok(ConversationMessage {
                id: row.get(0)?,
                session_id: row.get(1)?,
                role: MessageRole::parse(&role).unwrap_or(MessageRole::System),
                content: row.get(3)?,
                timestamp: parse_datetime(&row.get::<_, String>(4)?),
                action_ref: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ==================== Log events (optional persistence) ====================

    /// Persist a normalized log event for buffer-retention replay
    pub fn insert_log_event(&self, event: &LogEvent) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO log_events
             (id, service_id, environment_id, service_name, timestamp, level, message,
              severity_score, raw_metadata, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                Uuid::new_v4().to_string(),
                event.service_id,
                event.environment_id,
                event.service_name,
                event.timestamp.to_rfc3339(),
                event.level.as_str(),
                event.message,
                i64::from(event.severity_score()),
                serde_json::to_string(&event.raw_metadata).unwrap_or_else(|_| "{}".to_string()),
                event.source
            ],
        )?;
        Ok(())
    }

    // ==================== Retention ====================

    /// Delete rows whose anchor timestamp is older than `retention_days`.
    /// Messages and actions cascade from their parents; actions whose
    /// incident survives are swept by their own `requested_at`.
    pub fn sweep_expired(&self, retention_days: i64) -> DbResult<u64> {
        let cutoff = (Utc::now() - ChronoDuration::days(retention_days)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let mut deleted = 0u64;
        deleted += conn.execute(
            "DELETE FROM incidents WHERE detected_at < ?1",
            params![cutoff],
        )? as u64;
        deleted += conn.execute(
            "DELETE FROM remediation_actions WHERE requested_at < ?1",
            params![cutoff],
        )? as u64;
        deleted += conn.execute(
            "DELETE FROM conversation_sessions WHERE started_at < ?1",
            params![cutoff],
        )? as u64;
        Ok(deleted)
    }

    /// Drop buffered log events past the retention horizon
    pub fn sweep_log_events(&self, retention_hours: u32) -> DbResult<u64> {
        let cutoff = (Utc::now() - ChronoDuration::hours(i64::from(retention_hours))).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM log_events WHERE timestamp < ?1",
            params![cutoff],
        )? as u64;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(service: &str, fingerprint: &str) -> IncidentCandidate {
        IncidentCandidate {
            service_id: service.to_string(),
            service_name: format!("{service}-name"),
            environment_id: Some("env-1".to_string()),
            fingerprint: fingerprint.to_string(),
            severity: Severity::High,
            confidence: 0.9,
            root_cause: Some("oom".to_string()),
            recommended_action: RecommendedAction::Restart,
            reasoning: Some("pattern match".to_string()),
            log_context: serde_json::json!({"lines": 3}),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_upsert_creates_then_updates() {
        let db = Database::open_in_memory().unwrap();

        let first = db.upsert_incident(&candidate("svc-1", "fp-1")).unwrap();
        assert!(matches!(first, UpsertOutcome::Created(_)));
        let created = first.incident().clone();

        let second = db.upsert_incident(&candidate("svc-1", "fp-1")).unwrap();
        assert!(matches!(second, UpsertOutcome::Updated(_)));
        let updated = second.incident();

        assert_eq!(created.id, updated.id);
        assert_eq!(created.detected_at, db.get_incident(&created.id).unwrap().detected_at);
    }

    #[test]
    fn test_upsert_skips_terminal() {
        let db = Database::open_in_memory().unwrap();
        let incident = db
            .upsert_incident(&candidate("svc-1", "fp-1"))
            .unwrap()
            .incident()
            .clone();

        db.transition_incident(&incident.id, IncidentStatus::Ignored)
            .unwrap();

        let outcome = db.upsert_incident(&candidate("svc-1", "fp-1")).unwrap();
        assert!(matches!(outcome, UpsertOutcome::Skipped(_)));
        assert!(!outcome.should_publish());
        assert_eq!(outcome.incident().status, IncidentStatus::Ignored);
    }

    #[test]
    fn test_upsert_reopens_failed() {
        let db = Database::open_in_memory().unwrap();
        let incident = db
            .upsert_incident(&candidate("svc-1", "fp-1"))
            .unwrap()
            .incident()
            .clone();

        db.transition_incident(&incident.id, IncidentStatus::AwaitingAction)
            .unwrap();
        db.transition_incident(&incident.id, IncidentStatus::Failed)
            .unwrap();

        let outcome = db.upsert_incident(&candidate("svc-1", "fp-1")).unwrap();
        assert!(matches!(outcome, UpsertOutcome::Updated(_)));
        assert_eq!(outcome.incident().status, IncidentStatus::Detected);
    }

    #[test]
    fn test_distinct_fingerprints_create_distinct_rows() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_incident(&candidate("svc-1", "fp-1")).unwrap();
        db.upsert_incident(&candidate("svc-1", "fp-2")).unwrap();
        db.upsert_incident(&candidate("svc-2", "fp-1")).unwrap();
        assert_eq!(db.list_recent_incidents(10).unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let db = Database::open_in_memory().unwrap();
        let incident = db
            .upsert_incident(&candidate("svc-1", "fp-1"))
            .unwrap()
            .incident()
            .clone();

        let err = db
            .transition_incident(&incident.id, IncidentStatus::AutoRemediated)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidStatusTransition { .. }));
    }

    #[test]
    fn test_terminal_transition_sets_resolved_at() {
        let db = Database::open_in_memory().unwrap();
        let incident = db
            .upsert_incident(&candidate("svc-1", "fp-1"))
            .unwrap()
            .incident()
            .clone();
        assert!(incident.resolved_at.is_none());

        let resolved = db
            .transition_incident(&incident.id, IncidentStatus::Ignored)
            .unwrap();
        assert!(resolved.resolved_at.is_some());
    }

    #[test]
    fn test_at_most_one_open_action() {
        let db = Database::open_in_memory().unwrap();
        let incident = db
            .upsert_incident(&candidate("svc-1", "fp-1"))
            .unwrap()
            .incident()
            .clone();

        let action = db
            .create_action(
                &incident.id,
                InitiatorType::User,
                Some("U123"),
                ActionType::Restart,
                serde_json::json!({}),
            )
            .unwrap();

        let err = db
            .create_action(
                &incident.id,
                InitiatorType::Automated,
                None,
                ActionType::Restart,
                serde_json::json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, DbError::ConcurrentActionInProgress(_)));

        db.start_action(&action.id).unwrap();
        db.complete_action(&action.id, Some("restarted"), None)
            .unwrap();

        // Terminal action frees the slot.
        db.create_action(
            &incident.id,
            InitiatorType::Automated,
            None,
            ActionType::Restart,
            serde_json::json!({}),
        )
        .unwrap();
    }

    #[test]
    fn test_cascade_delete_actions_with_incident() {
        let db = Database::open_in_memory().unwrap();
        let incident = db
            .upsert_incident(&candidate("svc-1", "fp-1"))
            .unwrap()
            .incident()
            .clone();
        db.create_action(
            &incident.id,
            InitiatorType::User,
            None,
            ActionType::Restart,
            serde_json::json!({}),
        )
        .unwrap();

        // Sweep with a zero-day horizon removes everything.
        let deleted = db.sweep_expired(0).unwrap();
        assert!(deleted >= 1);
        assert!(db.list_actions(&incident.id).unwrap().is_empty());
    }

    #[test]
    fn test_session_reuse_by_channel_ref() {
        let db = Database::open_in_memory().unwrap();
        let a = db
            .find_or_create_session("chat", "C1:1234.5", "U1", None)
            .unwrap();
        let b = db
            .find_or_create_session("chat", "C1:1234.5", "U2", None)
            .unwrap();
        assert_eq!(a.id, b.id);
        // First writer wins the participant slot.
        assert_eq!(b.participant_id, "U1");
    }

    #[test]
    fn test_close_session_exactly_once() {
        let db = Database::open_in_memory().unwrap();
        let session = db
            .find_or_create_session("chat", "C1:1", "U1", None)
            .unwrap();
        db.close_session(&session.id).unwrap();
        let closed = db.get_session_by_ref("chat", "C1:1").unwrap();
        let first_close = closed.closed_at.unwrap();
        assert!(first_close >= closed.started_at);

        db.close_session(&session.id).unwrap();
        let again = db.get_session_by_ref("chat", "C1:1").unwrap();
        assert_eq!(again.closed_at.unwrap(), first_close);
    }

    #[test]
    fn test_messages_ordered_by_timestamp() {
        let db = Database::open_in_memory().unwrap();
        let session = db
            .find_or_create_session("chat", "C1:1", "U1", None)
            .unwrap();
        db.append_message(&session.id, MessageRole::System, "started", None)
            .unwrap();
        db.append_message(&session.id, MessageRole::User, "restart please", None)
            .unwrap();
        db.append_message(&session.id, MessageRole::Assistant, "on it", None)
            .unwrap();

        let messages = db.list_messages(&session.id).unwrap();
        assert_eq!(messages.len(), 3);
        for pair in messages.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_policy_defaults_on_first_observation() {
        let db = Database::open_in_memory().unwrap();
        let policy = db.ensure_policy("svc-1", "api").unwrap();
        assert!(!policy.auto_remediation_enabled);
        assert!((policy.confidence_threshold - 0.8).abs() < f64::EPSILON);

        db.update_policy("svc-1", true, 0.95).unwrap();
        let updated = db.get_policy("svc-1").unwrap();
        assert!(updated.auto_remediation_enabled);

        // ensure_policy on an existing row does not reset it.
        let again = db.ensure_policy("svc-1", "api").unwrap();
        assert!(again.auto_remediation_enabled);
    }

    #[test]
    fn test_stale_action_listing() {
        let db = Database::open_in_memory().unwrap();
        let incident = db
            .upsert_incident(&candidate("svc-1", "fp-1"))
            .unwrap()
            .incident()
            .clone();
        db.create_action(
            &incident.id,
            InitiatorType::Automated,
            None,
            ActionType::Restart,
            serde_json::json!({}),
        )
        .unwrap();

        let future = Utc::now() + ChronoDuration::minutes(11);
        assert_eq!(db.list_stale_actions(future).unwrap().len(), 1);
        let past = Utc::now() - ChronoDuration::minutes(11);
        assert!(db.list_stale_actions(past).unwrap().is_empty());
    }

    #[test]
    fn test_log_event_round_trip_and_sweep() {
        let db = Database::open_in_memory().unwrap();
        let event = LogEvent {
            service_id: "svc-1".to_string(),
            environment_id: None,
            service_name: None,
            timestamp: Utc::now() - ChronoDuration::hours(30),
            level: LogLevel::Error,
            message: "boom".to_string(),
            raw_metadata: std::collections::HashMap::new(),
            source: None,
        };
        db.insert_log_event(&event).unwrap();
        assert_eq!(db.sweep_log_events(24).unwrap(), 1);
    }
}
