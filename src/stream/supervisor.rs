//! Keyed supervisor for subscription tasks
//!
//! Owns the `target -> task` map. Start and stop are idempotent; abnormal
//! task exits are restarted with backoff and jitter until the hourly retry
//! budget is exhausted, after which the target is quarantined until
//! explicitly re-enabled.

use crate::detector::IngestBus;
use crate::stream::frame::SubscribePayload;
use crate::stream::subscription::{
    self, ConnectionHealth, SubscriptionHandle, SubscriptionSettings,
};
use crate::stream::machine::ConnStatus;
use crate::stream::MonitoringTarget;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

const STOP_WAIT_CEILING: Duration = Duration::from_secs(5);
const RESTART_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("target {0} is quarantined; re-enable it first")]
    Quarantined(String),
}

/// Point-in-time view of one managed connection
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionSnapshot {
    pub target: String,
    pub alive: bool,
    pub connected: bool,
    pub quarantined: bool,
    pub health: ConnectionHealth,
}

struct Entry {
    target: MonitoringTarget,
    handle: Mutex<SubscriptionHandle>,
    /// Set before a graceful stop so the monitor does not restart
    stopping: Arc<AtomicBool>,
    /// Flipped to false by the monitor when the task has fully exited
    alive_rx: watch::Receiver<bool>,
    quarantined: Arc<AtomicBool>,
    restarts: Arc<Mutex<Vec<Instant>>>,
}

/// Dynamic set of subscription tasks keyed by target
pub struct SubscriptionSupervisor {
    settings: SubscriptionSettings,
    ingest: Arc<IngestBus>,
    max_retry_attempts: u32,
    shutdown: watch::Receiver<bool>,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
}

impl SubscriptionSupervisor {
    pub fn new(
        settings: SubscriptionSettings,
        ingest: Arc<IngestBus>,
        max_retry_attempts: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            ingest,
            max_retry_attempts,
            shutdown,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Start a subscription for the target. Idempotent: a running target
    /// returns without spawning a second task.
    pub async fn start(self: &Arc<Self>, target: MonitoringTarget) -> Result<(), SupervisorError> {
        let key = target.key();
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&key) {
                if entry.quarantined.load(Ordering::SeqCst) {
                    return Err(SupervisorError::Quarantined(key));
                }
                if *entry.alive_rx.borrow() {
                    return Ok(());
                }
            }
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let quarantined = Arc::new(AtomicBool::new(false));
        let restarts = Arc::new(Mutex::new(Vec::new()));
        let (alive_tx, alive_rx) = watch::channel(true);

        let (handle, join) = subscription::spawn(
            target.clone(),
            self.settings.clone(),
            self.ingest.clone(),
            self.shutdown.clone(),
        );

        let entry = Arc::new(Entry {
            target: target.clone(),
            handle: Mutex::new(handle),
            stopping: stopping.clone(),
            alive_rx,
            quarantined: quarantined.clone(),
            restarts: restarts.clone(),
        });
        self.entries.write().await.insert(key.clone(), entry.clone());

        // Monitor: restart on abnormal exit, quarantine past the budget.
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut join = join;
            loop {
                let result = join.await;
                if entry.stopping.load(Ordering::SeqCst)
                    || *supervisor.shutdown.borrow()
                {
                    break;
                }
                if let Err(e) = result {
                    tracing::error!(target = %key, error = %e, "subscription task aborted");
                } else {
                    tracing::warn!(target = %key, "subscription task exited unexpectedly");
                }

                let recent = {
                    let mut restarts = entry.restarts.lock().unwrap();
                    let now = Instant::now();
                    restarts.retain(|t| now.duration_since(*t) < RESTART_WINDOW);
                    restarts.push(now);
                    restarts.len() as u32
                };
                if recent > supervisor.max_retry_attempts {
                    entry.quarantined.store(true, Ordering::SeqCst);
                    tracing::error!(
                        target = %key,
                        restarts_last_hour = recent,
                        "retry budget exhausted, target quarantined"
                    );
                    break;
                }

                let jitter = rand::thread_rng().gen_range(0..1000);
                let delay = Duration::from_millis(1000 * u64::from(recent) + jitter);
                tokio::time::sleep(delay).await;

                let (handle, new_join) = subscription::spawn(
                    entry.target.clone(),
                    supervisor.settings.clone(),
                    supervisor.ingest.clone(),
                    supervisor.shutdown.clone(),
                );
                *entry.handle.lock().unwrap() = handle;
                join = new_join;
                tracing::info!(target = %key, restart = recent, "subscription task restarted");
            }
            let _ = alive_tx.send(false);
        });

        Ok(())
    }

    /// Stop the target's task, waiting up to 5s for it to exit. Idempotent.
    pub async fn stop(&self, target_key: &str) {
        let entry = { self.entries.read().await.get(target_key).cloned() };
        let Some(entry) = entry else { return };

        entry.stopping.store(true, Ordering::SeqCst);
        let handle = entry.handle.lock().unwrap().clone();
        handle.stop().await;

        let mut alive = entry.alive_rx.clone();
        let wait = async {
            while *alive.borrow() {
                if alive.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(STOP_WAIT_CEILING, wait).await.is_err() {
            tracing::warn!(target = %target_key, "subscription did not exit within stop ceiling");
        }

        self.entries.write().await.remove(target_key);
    }

    /// Stop then start. Sequential per target.
    pub async fn restart(self: &Arc<Self>, target: MonitoringTarget) -> Result<(), SupervisorError> {
        self.stop(&target.key()).await;
        self.start(target).await
    }

    /// Clear a quarantine so the target may be started again.
    pub async fn reenable(&self, target_key: &str) {
        if let Some(entry) = self.entries.write().await.remove(target_key) {
            entry.quarantined.store(false, Ordering::SeqCst);
        }
    }

    /// Forward an extra subscription to a running target
    pub async fn subscribe_to_logs(
        &self,
        target_key: &str,
        payload: SubscribePayload,
    ) -> Option<String> {
        let entry = { self.entries.read().await.get(target_key).cloned() }?;
        let handle = entry.handle.lock().unwrap().clone();
        handle.subscribe(payload).await
    }

    /// Cancel one subscription id on a running target
    pub async fn unsubscribe(&self, target_key: &str, subscription_id: String) {
        let entry = { self.entries.read().await.get(target_key).cloned() };
        if let Some(entry) = entry {
            let handle = entry.handle.lock().unwrap().clone();
            handle.unsubscribe(subscription_id).await;
        }
    }

    /// Snapshot of every managed connection
    pub async fn list_connections(&self) -> Vec<ConnectionSnapshot> {
        let entries = self.entries.read().await;
        let mut snapshots: Vec<_> = entries
            .iter()
            .map(|(key, entry)| {
                let health = entry.handle.lock().unwrap().health();
                ConnectionSnapshot {
                    target: key.clone(),
                    alive: *entry.alive_rx.borrow(),
                    connected: health.status == ConnStatus::Connected,
                    quarantined: entry.quarantined.load(Ordering::SeqCst),
                    health,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }

    /// Whether at least one subscription is currently connected
    pub async fn any_connected(&self) -> bool {
        self.list_connections()
            .await
            .iter()
            .any(|snapshot| snapshot.connected)
    }
}
