//! Slack notifier
//!
//! Couples incidents to chat alerts: posts the initial block alert when an
//! incident is created, threads remediation progress under it, and records
//! the message threading. When Slack is not configured every operation
//! returns `NotConfigured` without failing the pipeline.

use super::blocks;
use crate::broker::Broker;
use crate::config::SlackConfig;
use crate::db::Incident;
use crate::events::{topics, PipelineEvent, UpsertKind};
use crate::telemetry::Telemetry;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";
const POST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SlackError {
    #[error("Slack integration is not configured")]
    NotConfigured,
    #[error("Slack transport failure: {0}")]
    Transport(String),
    #[error("Slack API error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Posts alerts and threaded updates to the configured channel
pub struct SlackNotifier {
    http: Client,
    bot_token: Option<String>,
    channel_id: Option<String>,
    telemetry: Arc<Telemetry>,
    /// incident id -> alert thread_ts
    threads: Mutex<HashMap<String, String>>,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig, telemetry: Arc<Telemetry>) -> Arc<Self> {
        let http = Client::builder()
            .timeout(POST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            http,
            bot_token: config.bot_token.clone(),
            channel_id: config.channel_id.clone(),
            telemetry,
            threads: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some() && self.channel_id.is_some()
    }

    fn credentials(&self) -> Result<(&str, &str), SlackError> {
        match (&self.bot_token, &self.channel_id) {
            (Some(token), Some(channel)) => Ok((token, channel)),
            _ => Err(SlackError::NotConfigured),
        }
    }

    async fn post(
        &self,
        text: &str,
        blocks: Option<serde_json::Value>,
        thread_ts: Option<&str>,
    ) -> Result<String, SlackError> {
        let (token, channel) = self.credentials()?;

        let mut body = json!({
            "channel": channel,
            "text": text,
        });
        if let Some(blocks) = blocks {
            body["blocks"] = blocks;
        }
        if let Some(ts) = thread_ts {
            body["thread_ts"] = json!(ts);
        }

        let response = self
            .http
            .post(POST_MESSAGE_URL)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SlackError::Transport(e.to_string()))?;

        let parsed: PostMessageResponse = response
            .json()
            .await
            .map_err(|e| SlackError::Transport(e.to_string()))?;

        if !parsed.ok {
            return Err(SlackError::Api(
                parsed.error.unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        parsed
            .ts
            .ok_or_else(|| SlackError::Api("response carried no ts".to_string()))
    }

    /// Post the block alert for a newly created incident and record its
    /// thread identity.
    pub async fn send_incident_alert(&self, incident: &Incident) -> Result<String, SlackError> {
        let blocks = blocks::incident_alert(incident);
        let fallback = format!(
            "{} {} incident on {}",
            blocks::severity_marker(incident.severity),
            incident.severity,
            incident.service_name
        );
        let ts = self
            .post(&fallback, Some(json!(blocks)), None)
            .await?;

        self.threads
            .lock()
            .unwrap()
            .insert(incident.id.clone(), ts.clone());

        let latency = (Utc::now() - incident.detected_at)
            .to_std()
            .unwrap_or_default();
        self.telemetry.record_alert_latency(latency);
        self.telemetry
            .alerts_posted
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(
            incident_id = %incident.id,
            thread_ts = %ts,
            latency_ms = %latency.as_millis(),
            "incident alert posted"
        );
        Ok(ts)
    }

    /// Thread identity recorded for an incident's alert, if any
    pub fn thread_for(&self, incident_id: &str) -> Option<String> {
        self.threads.lock().unwrap().get(incident_id).cloned()
    }

    /// Post a plain reply under the incident's alert thread (falls back to
    /// a top-level message when no alert was recorded).
    pub async fn post_thread_reply(
        &self,
        incident_id: &str,
        text: &str,
    ) -> Result<String, SlackError> {
        let thread = self.thread_for(incident_id);
        self.post(text, None, thread.as_deref()).await
    }

    /// Post the auto-fix confirmation prompt with its refined summary
    pub async fn post_confirmation(
        &self,
        incident: &Incident,
        refined: &str,
    ) -> Result<String, SlackError> {
        let blocks = blocks::auto_fix_confirmation(incident, refined);
        let thread = self.thread_for(&incident.id);
        self.post(
            &format!("Proposed fix for {}", incident.service_name),
            Some(json!(blocks)),
            thread.as_deref(),
        )
        .await
    }

    /// Alert + progress loop. Posts on new incidents and on remediation
    /// completion; an unconfigured integration degrades to a no-op.
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
                    Ok(PipelineEvent::IncidentDetected { incident, kind }) => {
                        // Recurrences of an open incident do not re-alert.
                        if kind != UpsertKind::Created {
                            continue;
                        }
                        match self.send_incident_alert(&incident).await {
                            Ok(_) => {}
                            Err(SlackError::NotConfigured) => {
                                tracing::debug!("Slack not configured; alert skipped");
                            }
                            Err(e) => {
                                tracing::error!(error = %e, incident_id = %incident.id, "alert post failed");
                                self.telemetry.record_error("notifier", "post");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "notifier lagged on incidents topic");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                event = remediations.recv() => match event {
                    Ok(PipelineEvent::RemediationCompleted { incident_id, success, message, .. }) => {
                        let text = if success {
                            format!(":white_check_mark: Remediation succeeded: {message}")
                        } else {
                            format!(":x: Remediation failed: {message}")
                        };
                        match self.post_thread_reply(&incident_id, &text).await {
                            Ok(_) | Err(SlackError::NotConfigured) => {}
                            Err(e) => {
                                tracing::error!(error = %e, incident_id = %incident_id, "progress post failed");
                                self.telemetry.record_error("notifier", "post");
                            }
                        }
                    }
                    Ok(PipelineEvent::RemediationSkipped { incident_id, reason }) => {
                        match self.post_thread_reply(&incident_id, &reason).await {
                            Ok(_) | Err(SlackError::NotConfigured) => {}
                            Err(e) => {
                                tracing::error!(error = %e, "skip reply failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "notifier lagged on remediation topic");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("notifier stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlackConfig;

    #[tokio::test]
    async fn test_unconfigured_notifier_returns_not_configured() {
        let notifier = SlackNotifier::new(&SlackConfig::default(), Telemetry::new());
        assert!(!notifier.is_configured());
        let err = notifier.post_thread_reply("inc-1", "hello").await.unwrap_err();
        assert!(matches!(err, SlackError::NotConfigured));
    }

    #[test]
    fn test_thread_recording() {
        let notifier = SlackNotifier::new(&SlackConfig::default(), Telemetry::new());
        assert!(notifier.thread_for("inc-1").is_none());
        notifier
            .threads
            .lock()
            .unwrap()
            .insert("inc-1".into(), "1234.5".into());
        assert_eq!(notifier.thread_for("inc-1").as_deref(), Some("1234.5"));
    }
}
