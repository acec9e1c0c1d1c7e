//! Telemetry collector
//!
//! Running aggregates for the pipeline components, exposed as a single
//! snapshot. Values are best-effort; counters are updated either directly
//! by the owning component or by the collector's broker subscription.

use crate::broker::Broker;
use crate::events::{topics, PipelineEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Running average in milliseconds with a max high-water mark
#[derive(Debug, Default)]
struct LatencyAggregate {
    total_ms: AtomicU64,
    count: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyAggregate {
    fn record(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            avg_ms: if count == 0 { 0 } else { total / count },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}

/// Aggregated pipeline counters
pub struct Telemetry {
    pub logs_ingested: AtomicU64,
    pub logs_dropped: AtomicU64,
    pub incidents_detected: AtomicU64,
    pub incidents_resolved: AtomicU64,
    pub remediations_succeeded: AtomicU64,
    pub remediations_failed: AtomicU64,
    pub llm_calls: AtomicU64,
    pub llm_failures: AtomicU64,
    pub alerts_posted: AtomicU64,
    errors: AtomicU64,
    alert_latency: LatencyAggregate,
    remediation_latency: LatencyAggregate,
    conversation_latency: LatencyAggregate,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            logs_ingested: AtomicU64::new(0),
            logs_dropped: AtomicU64::new(0),
            incidents_detected: AtomicU64::new(0),
            incidents_resolved: AtomicU64::new(0),
            remediations_succeeded: AtomicU64::new(0),
            remediations_failed: AtomicU64::new(0),
            llm_calls: AtomicU64::new(0),
            llm_failures: AtomicU64::new(0),
            alerts_posted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            alert_latency: LatencyAggregate::default(),
            remediation_latency: LatencyAggregate::default(),
            conversation_latency: LatencyAggregate::default(),
        })
    }

    pub fn record_alert_latency(&self, latency: Duration) {
        self.alert_latency.record(latency);
    }

    pub fn record_remediation_latency(&self, latency: Duration) {
        self.remediation_latency.record(latency);
    }

    pub fn record_conversation_latency(&self, latency: Duration) {
        self.conversation_latency.record(latency);
    }

    /// Count a classified error for a component
    pub fn record_error(&self, component: &str, kind: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(component, kind, "error counted");
    }

    pub fn snapshot(&self, active_subscriptions: usize, connected: usize) -> TelemetrySnapshot {
        TelemetrySnapshot {
            active_subscriptions,
            connected_subscriptions: connected,
            logs_ingested: self.logs_ingested.load(Ordering::Relaxed),
            logs_dropped: self.logs_dropped.load(Ordering::Relaxed),
            incidents_detected: self.incidents_detected.load(Ordering::Relaxed),
            incidents_resolved: self.incidents_resolved.load(Ordering::Relaxed),
            remediations_succeeded: self.remediations_succeeded.load(Ordering::Relaxed),
            remediations_failed: self.remediations_failed.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            llm_failures: self.llm_failures.load(Ordering::Relaxed),
            alerts_posted: self.alerts_posted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            alert_latency: self.alert_latency.snapshot(),
            remediation_latency: self.remediation_latency.snapshot(),
            conversation_latency: self.conversation_latency.snapshot(),
        }
    }

    /// Broker-fed counters: incidents and remediation outcomes.
    pub async fn run(
        self: Arc<Self>,
        broker: Arc<Broker>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut incidents = broker.subscribe(topics::INCIDENTS_NEW);
        let mut remediations = broker.subscribe(topics::REMEDIATION_ACTIONS);
        loop {
            tokio::select! {
                event = incidents.recv() => match event {
                    Ok(PipelineEvent::IncidentDetected { kind, .. }) => {
                        if kind == crate::events::UpsertKind::Created {
                            self.incidents_detected.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "telemetry lagged on incidents topic");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                event = remediations.recv() => match event {
                    Ok(PipelineEvent::RemediationCompleted { success, .. }) => {
                        if success {
                            self.remediations_succeeded.fetch_add(1, Ordering::Relaxed);
                            self.incidents_resolved.fetch_add(1, Ordering::Relaxed);
                        } else {
                            self.remediations_failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "telemetry lagged on remediation topic");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Point-in-time aggregate view
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub active_subscriptions: usize,
    pub connected_subscriptions: usize,
    pub logs_ingested: u64,
    pub logs_dropped: u64,
    pub incidents_detected: u64,
    pub incidents_resolved: u64,
    pub remediations_succeeded: u64,
    pub remediations_failed: u64,
    pub llm_calls: u64,
    pub llm_failures: u64,
    pub alerts_posted: u64,
    pub errors: u64,
    pub alert_latency: LatencySnapshot,
    pub remediation_latency: LatencySnapshot,
    pub conversation_latency: LatencySnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_aggregate() {
        let telemetry = Telemetry::new();
        telemetry.record_alert_latency(Duration::from_millis(100));
        telemetry.record_alert_latency(Duration::from_millis(300));
        let snapshot = telemetry.snapshot(0, 0);
        assert_eq!(snapshot.alert_latency.count, 2);
        assert_eq!(snapshot.alert_latency.avg_ms, 200);
        assert_eq!(snapshot.alert_latency.max_ms, 300);
    }

    #[tokio::test]
    async fn test_broker_fed_counters() {
        let telemetry = Telemetry::new();
        let broker = Arc::new(Broker::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(telemetry.clone().run(broker.clone(), shutdown_rx));
        // Give the collector a beat to subscribe.
        tokio::task::yield_now().await;

        broker.publish(
            topics::REMEDIATION_ACTIONS,
            PipelineEvent::RemediationCompleted {
                incident_id: "i1".into(),
                action_id: "a1".into(),
                success: true,
                message: "restarted".into(),
            },
        );
        broker.publish(
            topics::REMEDIATION_ACTIONS,
            PipelineEvent::RemediationCompleted {
                incident_id: "i2".into(),
                action_id: "a2".into(),
                success: false,
                message: "boom".into(),
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = telemetry.snapshot(0, 0);
        assert_eq!(snapshot.remediations_succeeded, 1);
        assert_eq!(snapshot.remediations_failed, 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
