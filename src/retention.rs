//! Retention worker
//!
//! Once per day (jittered) deletes incidents, actions, and sessions past
//! the retention horizon, plus buffered log events past theirs. Failures
//! are logged and swallowed; the next tick retries.

use crate::db::Database;
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_JITTER: Duration = Duration::from_secs(60 * 60);

pub async fn run(
    db: Database,
    retention_days: i64,
    buffer_retention_hours: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..MAX_JITTER.as_secs()));
        tokio::select! {
            () = tokio::time::sleep(SWEEP_INTERVAL + jitter) => {}
            _ = shutdown.changed() => {
                tracing::info!("retention worker stopped");
                return;
            }
        }

        match db.sweep_expired(retention_days) {
            Ok(deleted) => {
                tracing::info!(deleted, retention_days, "retention sweep complete");
            }
            Err(e) => {
                tracing::error!(error = %e, "retention sweep failed; will retry next tick");
            }
        }
        match db.sweep_log_events(buffer_retention_hours) {
            Ok(deleted) if deleted > 0 => {
                tracing::debug!(deleted, "log event buffer swept");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "log buffer sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IncidentCandidate, RecommendedAction, Severity};

    #[test]
    fn test_sweep_removes_only_expired_rows() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_incident(&IncidentCandidate {
            service_id: "svc-1".into(),
            service_name: "api".into(),
            environment_id: None,
            fingerprint: "fp".into(),
            severity: Severity::Low,
            confidence: 0.2,
            root_cause: None,
            recommended_action: RecommendedAction::None,
            reasoning: None,
            log_context: serde_json::json!({}),
            metadata: serde_json::json!({}),
        })
        .unwrap();

        // A 90-day horizon keeps the fresh row; a zero-day horizon removes it.
        assert_eq!(db.sweep_expired(90).unwrap(), 0);
        assert_eq!(db.sweep_expired(0).unwrap(), 1);
    }
}
