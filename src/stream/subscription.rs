//! Runtime task driving one subscription's connection state machine
//!
//! The task owns the WebSocket transport and feeds protocol frames, timer
//! expirations, and caller commands into the pure machine, executing the
//! effects it emits. Normalized log events are pushed to the ingest bus,
//! which never blocks this reader.

use crate::detector::IngestBus;
use crate::stream::frame::{self, Frame, SubscribePayload};
use crate::stream::machine::{
    self, ConnEffect, ConnEvent, ConnStatus, MachineState,
};
use crate::stream::MonitoringTarget;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_WS_ENDPOINT: &str = "wss://backboard.railway.com/graphql/v2";

/// Settings one subscription task runs with
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    pub token: String,
    pub endpoint: String,
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_backoff: Duration,
    pub level_filter: String,
}

impl SubscriptionSettings {
    pub fn new(token: impl Into<String>, perf: &crate::config::PerformanceConfig) -> Self {
        Self {
            token: token.into(),
            endpoint: DEFAULT_WS_ENDPOINT.to_string(),
            connection_timeout: perf.connection_timeout,
            heartbeat_interval: perf.heartbeat_interval,
            heartbeat_timeout: perf.heartbeat_timeout,
            max_backoff: perf.max_backoff,
            level_filter: "error".to_string(),
        }
    }
}

/// Health snapshot shared with the supervisor
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionHealth {
    pub status: ConnStatus,
    pub connection_attempts: u32,
    pub backoff_ms: u64,
    pub last_error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub events_received: u64,
    pub subscription_count: usize,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            status: ConnStatus::Disconnected,
            connection_attempts: 0,
            backoff_ms: machine::INITIAL_BACKOFF.as_millis() as u64,
            last_error: None,
            last_heartbeat: None,
            events_received: 0,
            subscription_count: 0,
        }
    }
}

enum Command {
    Subscribe {
        payload: SubscribePayload,
        reply: oneshot::Sender<String>,
    },
    Unsubscribe {
        id: String,
    },
    Stop,
}

/// Handle to a running subscription task
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub target: MonitoringTarget,
    command_tx: mpsc::Sender<Command>,
    health: Arc<Mutex<ConnectionHealth>>,
}

impl SubscriptionHandle {
    /// Issue an additional subscription on the open transport
    pub async fn subscribe(&self, payload: SubscribePayload) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Subscribe { payload, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Cancel one subscription id
    pub async fn unsubscribe(&self, id: String) {
        let _ = self.command_tx.send(Command::Unsubscribe { id }).await;
    }

    /// Graceful stop; the task sends `complete` frames and exits
    pub async fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop).await;
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.lock().unwrap().clone()
    }
}

/// Spawn the subscription task for a target. Returns the handle and the
/// join handle the supervisor watches.
pub fn spawn(
    target: MonitoringTarget,
    settings: SubscriptionSettings,
    ingest: Arc<IngestBus>,
    shutdown: watch::Receiver<bool>,
) -> (SubscriptionHandle, tokio::task::JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(16);
    let health = Arc::new(Mutex::new(ConnectionHealth::default()));
    let handle = SubscriptionHandle {
        target: target.clone(),
        command_tx,
        health: health.clone(),
    };

    let join = tokio::spawn(run(target, settings, ingest, command_rx, health, shutdown));
    (handle, join)
}

#[allow(clippy::too_many_lines)] // connection loop owns the whole lifecycle
async fn run(
    target: MonitoringTarget,
    settings: SubscriptionSettings,
    ingest: Arc<IngestBus>,
    mut commands: mpsc::Receiver<Command>,
    health: Arc<Mutex<ConnectionHealth>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state = MachineState::default();

    // The default query is issued once and re-issued by the machine after
    // every reconnect.
    let default_id = format!("sub-{}", Uuid::new_v4());
    let (next, _) = machine::transition(
        &state,
        settings.max_backoff,
        ConnEvent::SubscribeRequested {
            id: default_id,
            payload: frame::subscription_query(&target, &settings.level_filter),
        },
    );
    state = next;

    loop {
        // ---- connect phase ----
        let (next, effects) =
            machine::transition(&state, settings.max_backoff, ConnEvent::OpenRequested);
        state = next;
        publish_health(&health, &state, None);
        debug_assert_eq!(effects, vec![ConnEffect::OpenTransport]);

        let url = format!("{}?token={}", settings.endpoint, settings.token);
        let connect = tokio::time::timeout(
            settings.connection_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );

        let ws = tokio::select! {
            result = connect => match result {
                Ok(Ok((ws, _response))) => Some(ws),
                Ok(Err(e)) => {
                    let (next, _) = machine::transition(
                        &state,
                        settings.max_backoff,
                        ConnEvent::TransportFailed { reason: e.to_string() },
                    );
                    state = next;
                    None
                }
                Err(_elapsed) => {
                    let (next, _) = machine::transition(
                        &state,
                        settings.max_backoff,
                        ConnEvent::HandshakeTimeout,
                    );
                    state = next;
                    None
                }
            },
            _ = shutdown.changed() => return,
        };

        let Some(mut ws) = ws else {
            publish_health(&health, &state, None);
            tracing::warn!(
                target = %target.key(),
                attempts = state.connection_attempts,
                backoff_ms = %state.backoff.as_millis(),
                "log stream connect failed, backing off"
            );
            let deadline = Instant::now() + state.backoff;
            loop {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => break,
                    _ = shutdown.changed() => return,
                    command = commands.recv() => match command {
                        Some(Command::Stop) | None => return,
                        // Track subscriptions requested while offline; the
                        // machine re-issues them after the next ack.
                        Some(Command::Subscribe { payload, reply }) => {
                            let id = format!("sub-{}", Uuid::new_v4());
                            let _ = reply.send(id.clone());
                            let (next, _) = machine::transition(
                                &state,
                                settings.max_backoff,
                                ConnEvent::SubscribeRequested { id, payload },
                            );
                            state = next;
                        }
                        Some(Command::Unsubscribe { id }) => {
                            let (next, _) = machine::transition(
                                &state,
                                settings.max_backoff,
                                ConnEvent::UnsubscribeRequested { id },
                            );
                            state = next;
                        }
                    },
                }
            }
            continue;
        };

        // ---- handshake phase ----
        let (next, effects) =
            machine::transition(&state, settings.max_backoff, ConnEvent::TransportOpened);
        state = next;
        if execute_send_effects(&mut ws, effects).await.is_err() {
            let (next, _) = machine::transition(
                &state,
                settings.max_backoff,
                ConnEvent::TransportFailed {
                    reason: "init send failed".to_string(),
                },
            );
            state = next;
            publish_health(&health, &state, None);
            tokio::select! {
                () = tokio::time::sleep(state.backoff) => {}
                _ = shutdown.changed() => return,
            }
            continue;
        }

        // ---- connected loop ----
        let mut last_frame = Instant::now();
        let handshake_deadline = Instant::now() + settings.connection_timeout;
        let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stop_requested = false;

        loop {
            let event: Option<ConnEvent> = tokio::select! {
                message = ws.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        last_frame = Instant::now();
                        frame_to_event(&text)
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_frame = Instant::now();
                        None
                    }
                    Some(Ok(Message::Close(_))) | None => Some(ConnEvent::TransportFailed {
                        reason: "transport closed by peer".to_string(),
                    }),
                    Some(Ok(_)) => None,
                    Some(Err(e)) => Some(ConnEvent::TransportFailed { reason: e.to_string() }),
                },
                _ = heartbeat.tick() => {
                    if state.status == ConnStatus::Connected {
                        let elapsed = last_frame.elapsed();
                        if elapsed >= settings.heartbeat_timeout {
                            Some(ConnEvent::HeartbeatTimeout)
                        } else {
                            // Keepalive probe; the peer answers with pong.
                            let ping = Frame::Ping { payload: None };
                            if ws.send(Message::Text(ping.to_json())).await.is_err() {
                                Some(ConnEvent::TransportFailed {
                                    reason: "ping send failed".to_string(),
                                })
                            } else {
                                None
                            }
                        }
                    } else if Instant::now() >= handshake_deadline {
                        Some(ConnEvent::HandshakeTimeout)
                    } else {
                        None
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Subscribe { payload, reply }) => {
                        let id = format!("sub-{}", Uuid::new_v4());
                        let _ = reply.send(id.clone());
                        Some(ConnEvent::SubscribeRequested { id, payload })
                    }
                    Some(Command::Unsubscribe { id }) => {
                        Some(ConnEvent::UnsubscribeRequested { id })
                    }
                    Some(Command::Stop) | None => {
                        stop_requested = true;
                        Some(ConnEvent::StopRequested)
                    }
                },
                _ = shutdown.changed() => {
                    stop_requested = true;
                    Some(ConnEvent::StopRequested)
                },
            };

            let Some(event) = event else { continue };

            let (next, effects) = machine::transition(&state, settings.max_backoff, event);
            state = next;

            let mut reconnect_delay: Option<Duration> = None;
            let mut close = false;
            for effect in effects {
                match effect {
                    ConnEffect::SendFrame(frame) => {
                        if ws.send(Message::Text(frame.to_json())).await.is_err() {
                            close = true;
                        }
                    }
                    ConnEffect::PublishLogs { payload, .. } => {
                        let events = frame::extract_log_events(&payload, &target);
                        let count = events.len() as u64;
                        for event in events {
                            ingest.push(event);
                        }
                        let mut h = health.lock().unwrap();
                        h.events_received += count;
                    }
                    ConnEffect::ScheduleReconnect { delay } => reconnect_delay = Some(delay),
                    ConnEffect::CloseTransport => close = true,
                    ConnEffect::OpenTransport => {}
                }
            }

            publish_health(&health, &state, Some(Utc::now()));

            if close {
                let _ = ws.close(None).await;
            }

            if stop_requested {
                tracing::info!(target = %target.key(), "log stream stopped");
                return;
            }

            if let Some(delay) = reconnect_delay {
                tracing::warn!(
                    target = %target.key(),
                    error = state.last_error.as_deref().unwrap_or("unknown"),
                    delay_ms = %delay.as_millis(),
                    "log stream error, reconnecting"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
                break; // back to the connect phase
            }
        }
    }
}

/// Map an inbound protocol frame to a machine event.
fn frame_to_event(text: &str) -> Option<ConnEvent> {
    match Frame::parse(text) {
        Ok(Frame::ConnectionAck { .. }) => Some(ConnEvent::Ack),
        Ok(Frame::Ping { .. }) => Some(ConnEvent::PingReceived),
        Ok(Frame::Pong { .. }) => None,
        Ok(Frame::Next { id, payload }) => Some(ConnEvent::Data { id, payload }),
        Ok(Frame::Error { id, payload }) => Some(ConnEvent::SubscriptionError {
            id,
            message: payload.to_string(),
        }),
        Ok(Frame::Complete { id }) => Some(ConnEvent::SubscriptionComplete { id }),
        Ok(Frame::ConnectionInit { .. } | Frame::Subscribe { .. }) => None,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable frame ignored");
            None
        }
    }
}

async fn execute_send_effects(
    ws: &mut WsStream,
    effects: Vec<ConnEffect>,
) -> Result<(), ()> {
    for effect in effects {
        if let ConnEffect::SendFrame(frame) = effect {
            ws.send(Message::Text(frame.to_json()))
                .await
                .map_err(|_| ())?;
        }
    }
    Ok(())
}

fn publish_health(
    health: &Arc<Mutex<ConnectionHealth>>,
    state: &MachineState,
    heartbeat: Option<DateTime<Utc>>,
) {
    let mut h = health.lock().unwrap();
    h.status = state.status;
    h.connection_attempts = state.connection_attempts;
    h.backoff_ms = state.backoff.as_millis() as u64;
    h.last_error = state.last_error.clone();
    h.subscription_count = state.subscriptions.len();
    if let Some(ts) = heartbeat {
        h.last_heartbeat = Some(ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_to_event_mapping() {
        assert!(matches!(
            frame_to_event(r#"{"type":"connection_ack"}"#),
            Some(ConnEvent::Ack)
        ));
        assert!(matches!(
            frame_to_event(r#"{"type":"ping"}"#),
            Some(ConnEvent::PingReceived)
        ));
        assert!(frame_to_event(r#"{"type":"pong"}"#).is_none());
        assert!(matches!(
            frame_to_event(r#"{"type":"complete","id":"s1"}"#),
            Some(ConnEvent::SubscriptionComplete { .. })
        ));
        assert!(frame_to_event("not json").is_none());
    }

    #[test]
    fn test_default_health_matches_cold_machine() {
        let health = ConnectionHealth::default();
        assert_eq!(health.status, ConnStatus::Disconnected);
        assert_eq!(health.backoff_ms, 5_000);
        assert_eq!(health.connection_attempts, 0);
    }
}
