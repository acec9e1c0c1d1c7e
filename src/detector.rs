//! Log processor / incident detector
//!
//! Consumes the ingest bus and maintains a per-service sliding window. Two
//! detection lanes run over each window: fast regex signals (pattern lane)
//! and a batched, single-flight LLM classification (LLM lane). Candidates
//! are upserted into the incident store and fanned out on the broker.

mod fingerprint;
mod patterns;
mod window;

pub use fingerprint::{fingerprint, normalize_template};
pub use patterns::{evaluate as evaluate_patterns, PatternFinding};
pub use window::{SlidingWindow, DEFAULT_WINDOW};

use crate::broker::Broker;
use crate::db::{
    Database, IncidentCandidate, LogEvent, RecommendedAction, Severity, UpsertOutcome,
};
use crate::events::{topics, PipelineEvent, UpsertKind};
use crate::llm::{AnalysisRequest, AnalystRegistry, IncidentJudgment, LlmError, LogSample};
use crate::telemetry::Telemetry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

const LLM_TIMEOUT: Duration = Duration::from_secs(30);
/// Confidence for incidents classified by the pattern lane alone
const PATTERN_CONFIDENCE: f64 = 0.9;
/// Confidence ceiling when the LLM lane failed and patterns backstop it
const FALLBACK_CONFIDENCE: f64 = 0.5;
const PATTERN_REASONING: &str = "pattern match";

// ============================================================================
// Ingest bus
// ============================================================================

/// Bounded per-service queues between the stream readers and the detector.
///
/// `push` never blocks: when a service's queue is full the oldest event is
/// dropped and counted. A single consumer drains queues via `recv`,
/// preserving per-service ordering.
pub struct IngestBus {
    capacity: usize,
    queues: Mutex<HashMap<String, VecDeque<LogEvent>>>,
    dropped: AtomicU64,
    notify: Notify,
}

impl IngestBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            queues: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Enqueue one event, evicting the oldest on overflow.
    pub fn push(&self, event: LogEvent) {
        {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues.entry(event.service_id.clone()).or_default();
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<LogEvent> {
        let mut queues = self.queues.lock().unwrap();
        for queue in queues.values_mut() {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
        }
        None
    }

    /// Await the next event. Single-consumer.
    pub async fn recv(&self) -> LogEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return event;
            }
            notified.await;
        }
    }

    /// Total events dropped to backpressure since start
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Detector
// ============================================================================

struct ServiceState {
    window: SlidingWindow,
    batch_armed: bool,
    llm_in_flight: bool,
    pending_retrigger: bool,
    /// What the in-flight analysis saw, restored on completion
    pending_snapshot: Option<(Vec<LogEvent>, Option<PatternFinding>)>,
}

impl ServiceState {
    fn new(capacity: usize) -> Self {
        Self {
            window: SlidingWindow::new(capacity),
            batch_armed: false,
            llm_in_flight: false,
            pending_retrigger: false,
            pending_snapshot: None,
        }
    }
}

enum DetectorMsg {
    BatchDue {
        service_id: String,
    },
    Analyzed {
        service_id: String,
        result: Result<IncidentJudgment, LlmError>,
    },
}

/// The detector task
pub struct Detector {
    db: Database,
    broker: Arc<Broker>,
    analysts: Arc<AnalystRegistry>,
    telemetry: Arc<Telemetry>,
    ingest: Arc<IngestBus>,
    window_capacity: usize,
    batch_window: Duration,
    persist_log_events: bool,
}

impl Detector {
    pub fn new(
        db: Database,
        broker: Arc<Broker>,
        analysts: Arc<AnalystRegistry>,
        telemetry: Arc<Telemetry>,
        ingest: Arc<IngestBus>,
        batch_window: Duration,
    ) -> Self {
        Self {
            db,
            broker,
            analysts,
            telemetry,
            ingest,
            window_capacity: DEFAULT_WINDOW,
            batch_window,
            persist_log_events: true,
        }
    }

    #[allow(clippy::too_many_lines)] // event loop dispatch
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (msg_tx, mut msg_rx) = mpsc::channel::<DetectorMsg>(64);
        let mut services: HashMap<String, ServiceState> = HashMap::new();
        let mut known_services: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                event = self.ingest.recv() => {
                    self.on_event(event, &mut services, &mut known_services, &msg_tx);
                }
                Some(msg) = msg_rx.recv() => match msg {
                    DetectorMsg::BatchDue { service_id } => {
                        self.on_batch_due(&service_id, &mut services, &msg_tx);
                    }
                    DetectorMsg::Analyzed { service_id, result } => {
                        self.on_analyzed(&service_id, result, &mut services, &msg_tx);
                    }
                },
                _ = shutdown.changed() => {
                    self.flush(&services);
                    tracing::info!("detector stopped");
                    return;
                }
            }
        }
    }

    fn on_event(
        &self,
        event: LogEvent,
        services: &mut HashMap<String, ServiceState>,
        known_services: &mut HashSet<String>,
        msg_tx: &mpsc::Sender<DetectorMsg>,
    ) {
        self.telemetry.logs_ingested.fetch_add(1, Ordering::Relaxed);
        let service_id = event.service_id.clone();

        // First observation of a service provisions its default policy.
        if known_services.insert(service_id.clone()) {
            let name = event.service_name.clone().unwrap_or_else(|| service_id.clone());
            if let Err(e) = self.db.ensure_policy(&service_id, &name) {
                tracing::warn!(service_id = %service_id, error = %e, "policy provisioning failed");
                self.telemetry.record_error("detector", "policy_provision");
            }
        }

        if self.persist_log_events && event.severity_score() >= 4 {
            if let Err(e) = self.db.insert_log_event(&event) {
                tracing::debug!(error = %e, "log event persistence failed");
            }
        }

        self.broker.publish(
            &topics::railway_logs(&service_id),
            PipelineEvent::LogVolume {
                service_id: service_id.clone(),
                count: 1,
            },
        );

        let state = services
            .entry(service_id.clone())
            .or_insert_with(|| ServiceState::new(self.window_capacity));
        state.window.push(event);

        let window = state.window.events();
        let pattern = evaluate_patterns(&window);

        // Pattern lane reaching critical short-circuits the LLM lane.
        if let Some(finding) = &pattern {
            if finding.severity == Severity::Critical {
                let candidate = candidate_from_pattern(&window, finding);
                self.upsert_and_publish(candidate);
                return;
            }
        }

        if state.window.max_severity_score() >= 4 && !state.batch_armed && !state.llm_in_flight {
            state.batch_armed = true;
            let tx = msg_tx.clone();
            let service_id = service_id.clone();
            let delay = self.batch_window;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(DetectorMsg::BatchDue { service_id }).await;
            });
        }
    }

    fn on_batch_due(
        &self,
        service_id: &str,
        services: &mut HashMap<String, ServiceState>,
        msg_tx: &mpsc::Sender<DetectorMsg>,
    ) {
        let Some(state) = services.get_mut(service_id) else { return };
        state.batch_armed = false;

        let snapshot = state.window.events();
        // An empty batch, or one with no qualifying event, never calls the
        // classifier.
        if snapshot.is_empty() || state.window.max_severity_score() < 4 {
            return;
        }

        let pattern = evaluate_patterns(&snapshot);
        if let Some(finding) = pattern.as_ref().filter(|f| f.severity == Severity::Critical) {
            let candidate = candidate_from_pattern(&snapshot, finding);
            self.upsert_and_publish(candidate);
            return;
        }

        if state.llm_in_flight {
            state.pending_retrigger = true;
            return;
        }

        let policy_provider = self
            .db
            .get_policy(service_id)
            .map(|p| p.llm_provider)
            .unwrap_or_else(|_| "auto".to_string());

        let Some(analyst) = self.analysts.select(&policy_provider) else {
            // No provider configured: patterns are all we have.
            let candidate = fallback_candidate(&snapshot, pattern.as_ref());
            self.upsert_and_publish(candidate);
            return;
        };

        state.llm_in_flight = true;
        self.telemetry.llm_calls.fetch_add(1, Ordering::Relaxed);

        let request = AnalysisRequest {
            service_id: service_id.to_string(),
            service_name: snapshot
                .iter()
                .find_map(|e| e.service_name.clone())
                .unwrap_or_else(|| service_id.to_string()),
            samples: snapshot
                .iter()
                .map(|e| LogSample {
                    timestamp: e.timestamp,
                    level: e.level.as_str().to_string(),
                    message: e.message.clone(),
                })
                .collect(),
            pattern_hint: pattern
                .as_ref()
                .map(|f| format!("{}: {}", f.severity, f.signal)),
        };

        let tx = msg_tx.clone();
        let service_id = service_id.to_string();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(LLM_TIMEOUT, analyst.analyze(&request)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(LlmError::network("analysis timed out")),
            };
            let _ = tx
                .send(DetectorMsg::Analyzed { service_id, result })
                .await;
        });

        // Stash the snapshot and pattern with the in-flight marker so the
        // completion handler classifies against what the model saw.
        state.pending_snapshot = Some((snapshot, pattern));
    }

    fn on_analyzed(
        &self,
        service_id: &str,
        result: Result<IncidentJudgment, LlmError>,
        services: &mut HashMap<String, ServiceState>,
        msg_tx: &mpsc::Sender<DetectorMsg>,
    ) {
        let Some(state) = services.get_mut(service_id) else { return };
        state.llm_in_flight = false;
        let (snapshot, pattern) = state
            .pending_snapshot
            .take()
            .unwrap_or_else(|| (state.window.events(), None));

        let candidate = match result {
            Ok(judgment) => candidate_from_judgment(service_id, &snapshot, &judgment),
            Err(e) => {
                self.telemetry.llm_failures.fetch_add(1, Ordering::Relaxed);
                self.telemetry.record_error("detector", "llm");
                tracing::warn!(service_id = %service_id, error = %e, "LLM lane failed, using pattern fallback");
                fallback_candidate(&snapshot, pattern.as_ref())
            }
        };
        self.upsert_and_publish(candidate);

        if state.pending_retrigger {
            state.pending_retrigger = false;
            state.batch_armed = true;
            let tx = msg_tx.clone();
            let service_id = service_id.to_string();
            let delay = self.batch_window;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(DetectorMsg::BatchDue { service_id }).await;
            });
        }
    }

    /// Shutdown flush: classify armed batches with the pattern lane only.
    fn flush(&self, services: &HashMap<String, ServiceState>) {
        for (service_id, state) in services {
            if !state.batch_armed && !state.llm_in_flight {
                continue;
            }
            let snapshot = state.window.events();
            if snapshot.is_empty() || state.window.max_severity_score() < 4 {
                continue;
            }
            let pattern = evaluate_patterns(&snapshot);
            tracing::info!(service_id = %service_id, "flushing pending batch on shutdown");
            self.upsert_and_publish(fallback_candidate(&snapshot, pattern.as_ref()));
        }
    }

    fn upsert_and_publish(&self, candidate: IncidentCandidate) {
        match self.db.upsert_incident(&candidate) {
            Ok(outcome) => {
                if !outcome.should_publish() {
                    return;
                }
                let kind = match &outcome {
                    UpsertOutcome::Created(_) => UpsertKind::Created,
                    UpsertOutcome::Updated(_) | UpsertOutcome::Skipped(_) => UpsertKind::Updated,
                };
                let incident = outcome.incident().clone();
                tracing::info!(
                    incident_id = %incident.id,
                    service_id = %incident.service_id,
                    severity = %incident.severity,
                    kind = ?kind,
                    "incident persisted"
                );
                let event = PipelineEvent::IncidentDetected {
                    incident: Box::new(incident),
                    kind,
                };
                self.broker.publish(topics::INCIDENTS_NEW, event.clone());
                self.broker.publish(topics::DASHBOARD_INCIDENTS, event);
            }
            Err(e) => {
                tracing::error!(error = %e, "incident upsert failed");
                self.telemetry.record_error("detector", "upsert");
            }
        }
    }
}

// ============================================================================
// Candidate construction
// ============================================================================

/// The event a fingerprint anchors on: the most recent highest-severity one.
fn anchor_event<'a>(snapshot: &'a [LogEvent]) -> Option<&'a LogEvent> {
    snapshot
        .iter()
        .rev()
        .max_by_key(|e| (e.severity_score(), e.timestamp))
}

fn log_context(snapshot: &[LogEvent], signal: Option<&str>) -> serde_json::Value {
    let recent: Vec<String> = snapshot
        .iter()
        .rev()
        .take(5)
        .map(|e| format!("[{}] {}", e.level, e.message))
        .collect();
    serde_json::json!({
        "recent": recent,
        "window_len": snapshot.len(),
        "signal": signal,
    })
}

fn base_candidate(snapshot: &[LogEvent]) -> (String, String, Option<String>, String) {
    let anchor = anchor_event(snapshot).expect("snapshot is non-empty");
    let service_id = anchor.service_id.clone();
    let service_name = anchor
        .service_name
        .clone()
        .unwrap_or_else(|| service_id.clone());
    let environment_id = anchor.environment_id.clone();
    let print = fingerprint(&service_id, anchor.level, &anchor.message);
    (service_id, service_name, environment_id, print)
}

fn candidate_from_pattern(snapshot: &[LogEvent], finding: &PatternFinding) -> IncidentCandidate {
    let (service_id, service_name, environment_id, print) = base_candidate(snapshot);
    IncidentCandidate {
        service_id,
        service_name,
        environment_id,
        fingerprint: print,
        severity: finding.severity,
        confidence: PATTERN_CONFIDENCE,
        root_cause: Some(finding.matched_message.clone()),
        recommended_action: finding.recommended_action,
        reasoning: Some(PATTERN_REASONING.to_string()),
        log_context: log_context(snapshot, Some(finding.signal)),
        metadata: serde_json::json!({ "lane": "pattern" }),
    }
}

fn candidate_from_judgment(
    service_id: &str,
    snapshot: &[LogEvent],
    judgment: &IncidentJudgment,
) -> IncidentCandidate {
    let (anchored_service, service_name, environment_id, print) = base_candidate(snapshot);
    debug_assert_eq!(anchored_service, service_id);
    IncidentCandidate {
        service_id: anchored_service,
        service_name,
        environment_id,
        fingerprint: print,
        severity: judgment.severity,
        confidence: judgment.confidence,
        root_cause: Some(judgment.root_cause.clone()),
        recommended_action: judgment.recommended_action,
        reasoning: Some(judgment.reasoning.clone()),
        log_context: log_context(snapshot, None),
        metadata: serde_json::json!({ "lane": "llm" }),
    }
}

/// LLM unavailable or failed: fall back to the pattern finding with
/// reduced confidence, or to a severity derived from the log levels.
fn fallback_candidate(
    snapshot: &[LogEvent],
    pattern: Option<&PatternFinding>,
) -> IncidentCandidate {
    let (service_id, service_name, environment_id, print) = base_candidate(snapshot);
    let (severity, action, root_cause, signal) = match pattern {
        Some(finding) => (
            finding.severity,
            finding.recommended_action,
            finding.matched_message.clone(),
            Some(finding.signal),
        ),
        None => {
            let anchor = anchor_event(snapshot).expect("snapshot is non-empty");
            let severity = if anchor.severity_score() >= 5 {
                Severity::Critical
            } else {
                Severity::High
            };
            (severity, RecommendedAction::None, anchor.message.clone(), None)
        }
    };
    IncidentCandidate {
        service_id,
        service_name,
        environment_id,
        fingerprint: print,
        severity,
        confidence: FALLBACK_CONFIDENCE,
        root_cause: Some(root_cause),
        recommended_action: action,
        reasoning: Some(PATTERN_REASONING.to_string()),
        log_context: log_context(snapshot, signal),
        metadata: serde_json::json!({ "lane": "fallback" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LogLevel;
    use chrono::Utc;

    fn event(service: &str, level: LogLevel, message: &str) -> LogEvent {
        LogEvent {
            service_id: service.into(),
            environment_id: Some("env-1".into()),
            service_name: Some(format!("{service}-name")),
            timestamp: Utc::now(),
            level,
            message: message.into(),
            raw_metadata: HashMap::new(),
            source: None,
        }
    }

    #[test]
    fn test_ingest_bus_drops_oldest() {
        let bus = IngestBus::new(3);
        for i in 0..5 {
            bus.push(event("svc-1", LogLevel::Info, &format!("line {i}")));
        }
        assert_eq!(bus.dropped(), 2);
        let first = bus.try_pop().unwrap();
        assert_eq!(first.message, "line 2");
    }

    #[tokio::test]
    async fn test_ingest_bus_recv_preserves_service_order() {
        let bus = IngestBus::new(100);
        bus.push(event("svc-1", LogLevel::Info, "first"));
        bus.push(event("svc-1", LogLevel::Info, "second"));
        let a = bus.recv().await;
        let b = bus.recv().await;
        assert_eq!(a.message, "first");
        assert_eq!(b.message, "second");
    }

    #[test]
    fn test_pattern_candidate_carries_fingerprint_and_context() {
        let snapshot = vec![event(
            "svc-1",
            LogLevel::Fatal,
            "FATAL: Out of memory - killed by OOM killer",
        )];
        let finding = evaluate_patterns(&snapshot).unwrap();
        let candidate = candidate_from_pattern(&snapshot, &finding);
        assert_eq!(candidate.service_id, "svc-1");
        assert_eq!(candidate.severity, Severity::Critical);
        assert!(!candidate.fingerprint.is_empty());
        assert_eq!(candidate.log_context["window_len"], 1);
        assert_eq!(candidate.reasoning.as_deref(), Some("pattern match"));
    }

    #[test]
    fn test_fallback_without_pattern_uses_levels() {
        let snapshot = vec![event("svc-1", LogLevel::Error, "something odd happened")];
        let candidate = fallback_candidate(&snapshot, None);
        assert_eq!(candidate.severity, Severity::High);
        assert!((candidate.confidence - FALLBACK_CONFIDENCE).abs() < f64::EPSILON);
        assert_eq!(candidate.recommended_action, RecommendedAction::None);
    }

    #[test]
    fn test_fallback_confidence_capped() {
        let snapshot = vec![event("svc-1", LogLevel::Error, "connection refused by db")];
        let finding = evaluate_patterns(&snapshot).unwrap();
        let candidate = fallback_candidate(&snapshot, Some(&finding));
        assert!(candidate.confidence <= 0.5);
        assert_eq!(candidate.severity, Severity::High);
    }

    #[test]
    fn test_anchor_prefers_most_severe_recent() {
        let mut snapshot = vec![
            event("svc-1", LogLevel::Info, "starting"),
            event("svc-1", LogLevel::Error, "first error"),
        ];
        snapshot.push(event("svc-1", LogLevel::Error, "second error"));
        let anchor = anchor_event(&snapshot).unwrap();
        assert_eq!(anchor.message, "second error");
    }
}
