//! Per-target connection state machine
//!
//! Pure transitions: given the current machine state and an event, produce
//! the next state and a list of effects for the runtime to execute. No I/O
//! and no clock access happens here; timeouts arrive as events.

use crate::stream::frame::{Frame, SubscribePayload};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Floor of the reconnect backoff schedule.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(5_000);

/// Connection status as reported in health snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Machine state carried across transitions
#[derive(Debug, Clone)]
pub struct MachineState {
    pub status: ConnStatus,
    pub connection_attempts: u32,
    pub backoff: Duration,
    pub last_error: Option<String>,
    /// Active subscription ids and their payloads, re-issued after reconnect
    pub subscriptions: BTreeMap<String, SubscribePayload>,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            status: ConnStatus::Disconnected,
            connection_attempts: 0,
            backoff: INITIAL_BACKOFF,
            last_error: None,
            subscriptions: BTreeMap::new(),
        }
    }
}

/// Events fed to the machine by the runtime
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// Open (or re-open) the transport
    OpenRequested,
    /// Socket established; handshake may begin
    TransportOpened,
    /// Peer acknowledged the connection
    Ack,
    /// Peer sent a keepalive ping
    PingReceived,
    /// Caller wants a new subscription
    SubscribeRequested { id: String, payload: SubscribePayload },
    /// Caller cancels a subscription
    UnsubscribeRequested { id: String },
    /// A `next` frame arrived for a subscription
    Data { id: String, payload: Value },
    /// The peer terminated one subscription with an error
    SubscriptionError { id: String, message: String },
    /// The peer completed one subscription; the transport stays open
    SubscriptionComplete { id: String },
    /// No ack within the connection timeout
    HandshakeTimeout,
    /// No frame of any kind within the heartbeat timeout
    HeartbeatTimeout,
    /// The transport failed or closed unexpectedly
    TransportFailed { reason: String },
    /// Graceful stop; no reconnect is scheduled
    StopRequested,
}

/// Effects the runtime executes after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum ConnEffect {
    OpenTransport,
    SendFrame(Frame),
    /// Normalize and publish the log entries in `payload`
    PublishLogs { subscription_id: String, payload: Value },
    ScheduleReconnect { delay: Duration },
    CloseTransport,
}

/// Backoff for the given attempt count: `min(5s * 2^(attempts-1), max)`.
/// Monotone in `attempts` and bounded to `[5s, max]`.
pub fn backoff_for_attempts(attempts: u32, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(10);
    let delay = INITIAL_BACKOFF * 2u32.saturating_pow(exponent);
    delay.clamp(INITIAL_BACKOFF, max.max(INITIAL_BACKOFF))
}

/// Pure transition function.
#[allow(clippy::too_many_lines)] // state machine is inherently branchy
pub fn transition(
    state: &MachineState,
    max_backoff: Duration,
    event: ConnEvent,
) -> (MachineState, Vec<ConnEffect>) {
    let mut next = state.clone();
    let mut effects = Vec::new();

    match (state.status, event) {
        // ============================================================
        // Opening
        // ============================================================
        (ConnStatus::Disconnected | ConnStatus::Error, ConnEvent::OpenRequested) => {
            next.status = ConnStatus::Connecting;
            next.connection_attempts = state.connection_attempts.saturating_add(1);
            effects.push(ConnEffect::OpenTransport);
        }

        (ConnStatus::Connecting, ConnEvent::TransportOpened) => {
            effects.push(ConnEffect::SendFrame(Frame::ConnectionInit { payload: None }));
        }

        (ConnStatus::Connecting, ConnEvent::Ack) => {
            next.status = ConnStatus::Connected;
            next.connection_attempts = 0;
            next.backoff = INITIAL_BACKOFF;
            next.last_error = None;
            // Re-issue any subscriptions that predate the reconnect.
            for (id, payload) in &state.subscriptions {
                effects.push(ConnEffect::SendFrame(Frame::Subscribe {
                    id: id.clone(),
                    payload: payload.clone(),
                }));
            }
        }

        // ============================================================
        // Steady state
        // ============================================================
        (ConnStatus::Connected, ConnEvent::PingReceived) => {
            effects.push(ConnEffect::SendFrame(Frame::Pong { payload: None }));
        }

        (ConnStatus::Connected, ConnEvent::Data { id, payload }) => {
            effects.push(ConnEffect::PublishLogs {
                subscription_id: id,
                payload,
            });
        }

        (_, ConnEvent::SubscribeRequested { id, payload }) => {
            if state.status == ConnStatus::Connected {
                effects.push(ConnEffect::SendFrame(Frame::Subscribe {
                    id: id.clone(),
                    payload: payload.clone(),
                }));
            }
            next.subscriptions.insert(id, payload);
        }

        (_, ConnEvent::UnsubscribeRequested { id }) => {
            if next.subscriptions.remove(&id).is_some() && state.status == ConnStatus::Connected {
                effects.push(ConnEffect::SendFrame(Frame::Complete { id }));
            }
        }

        (ConnStatus::Connected, ConnEvent::SubscriptionError { id, message }) => {
            next.subscriptions.remove(&id);
            next.last_error = Some(message);
        }

        (ConnStatus::Connected, ConnEvent::SubscriptionComplete { id }) => {
            next.subscriptions.remove(&id);
        }

        // ============================================================
        // Failure paths
        // ============================================================
        (ConnStatus::Connecting, ConnEvent::HandshakeTimeout) => {
            fail(&mut next, "handshake timed out".to_string(), max_backoff, &mut effects);
        }

        (ConnStatus::Connected, ConnEvent::HeartbeatTimeout) => {
            fail(&mut next, "heartbeat timed out".to_string(), max_backoff, &mut effects);
        }

        (
            ConnStatus::Connecting | ConnStatus::Connected,
            ConnEvent::TransportFailed { reason },
        ) => {
            fail(&mut next, reason, max_backoff, &mut effects);
        }

        // ============================================================
        // Graceful stop - converges with a cold start
        // ============================================================
        (status, ConnEvent::StopRequested) => {
            if status == ConnStatus::Connected {
                for id in state.subscriptions.keys() {
                    effects.push(ConnEffect::SendFrame(Frame::Complete { id: id.clone() }));
                }
            }
            if matches!(status, ConnStatus::Connected | ConnStatus::Connecting) {
                effects.push(ConnEffect::CloseTransport);
            }
            next = MachineState::default();
        }

        // Everything else is a no-op (late frames after stop, duplicate acks).
        _ => {}
    }

    (next, effects)
}

fn fail(
    next: &mut MachineState,
    reason: String,
    max_backoff: Duration,
    effects: &mut Vec<ConnEffect>,
) {
    next.status = ConnStatus::Error;
    next.last_error = Some(reason);
    next.backoff = backoff_for_attempts(next.connection_attempts.max(1), max_backoff);
    effects.push(ConnEffect::CloseTransport);
    effects.push(ConnEffect::ScheduleReconnect { delay: next.backoff });
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_BACKOFF: Duration = Duration::from_secs(60);

    fn payload() -> SubscribePayload {
        SubscribePayload {
            query: "subscription { environmentLogs }".to_string(),
            variables: None,
        }
    }

    fn connected_state() -> MachineState {
        let state = MachineState::default();
        let (state, _) = transition(&state, MAX_BACKOFF, ConnEvent::OpenRequested);
        let (state, _) = transition(&state, MAX_BACKOFF, ConnEvent::TransportOpened);
        let (state, _) = transition(&state, MAX_BACKOFF, ConnEvent::Ack);
        state
    }

    #[test]
    fn test_cold_start_to_connected() {
        let state = MachineState::default();

        let (state, effects) = transition(&state, MAX_BACKOFF, ConnEvent::OpenRequested);
        assert_eq!(state.status, ConnStatus::Connecting);
        assert_eq!(state.connection_attempts, 1);
        assert_eq!(effects, vec![ConnEffect::OpenTransport]);

        let (state, effects) = transition(&state, MAX_BACKOFF, ConnEvent::TransportOpened);
        assert!(matches!(
            effects.as_slice(),
            [ConnEffect::SendFrame(Frame::ConnectionInit { .. })]
        ));

        let (state, _) = transition(&state, MAX_BACKOFF, ConnEvent::Ack);
        assert_eq!(state.status, ConnStatus::Connected);
        assert_eq!(state.connection_attempts, 0);
        assert_eq!(state.backoff, INITIAL_BACKOFF);
    }

    #[test]
    fn test_ack_reissues_prior_subscriptions() {
        let mut state = connected_state();
        let (with_sub, _) = transition(
            &state,
            MAX_BACKOFF,
            ConnEvent::SubscribeRequested {
                id: "sub-1".into(),
                payload: payload(),
            },
        );
        state = with_sub;

        let (state, _) = transition(
            &state,
            MAX_BACKOFF,
            ConnEvent::TransportFailed {
                reason: "reset".into(),
            },
        );
        let (state, _) = transition(&state, MAX_BACKOFF, ConnEvent::OpenRequested);
        let (state, _) = transition(&state, MAX_BACKOFF, ConnEvent::TransportOpened);
        let (_, effects) = transition(&state, MAX_BACKOFF, ConnEvent::Ack);

        assert!(effects.iter().any(|e| matches!(
            e,
            ConnEffect::SendFrame(Frame::Subscribe { id, .. }) if id == "sub-1"
        )));
    }

    #[test]
    fn test_heartbeat_timeout_schedules_reconnect() {
        let state = connected_state();
        let (state, effects) = transition(&state, MAX_BACKOFF, ConnEvent::HeartbeatTimeout);
        assert_eq!(state.status, ConnStatus::Error);
        assert!(state.last_error.is_some());
        assert!(effects.contains(&ConnEffect::CloseTransport));
        assert!(effects
            .iter()
            .any(|e| matches!(e, ConnEffect::ScheduleReconnect { .. })));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut state = MachineState::default();
        let mut last_backoff = Duration::ZERO;
        for _ in 0..12 {
            let (open, _) = transition(&state, MAX_BACKOFF, ConnEvent::OpenRequested);
            let (failed, _) = transition(
                &open,
                MAX_BACKOFF,
                ConnEvent::TransportFailed {
                    reason: "refused".into(),
                },
            );
            assert!(failed.backoff >= last_backoff);
            assert!(failed.backoff >= INITIAL_BACKOFF);
            assert!(failed.backoff <= MAX_BACKOFF);
            last_backoff = failed.backoff;
            state = failed;
        }
        assert_eq!(last_backoff, MAX_BACKOFF);
    }

    #[test]
    fn test_stop_converges_with_cold_start() {
        let state = connected_state();
        let (state, _) = transition(
            &state,
            MAX_BACKOFF,
            ConnEvent::SubscribeRequested {
                id: "sub-1".into(),
                payload: payload(),
            },
        );

        let (stopped, effects) = transition(&state, MAX_BACKOFF, ConnEvent::StopRequested);
        assert_eq!(stopped.status, ConnStatus::Disconnected);
        assert_eq!(stopped.connection_attempts, 0);
        assert!(stopped.subscriptions.is_empty());
        // Graceful complete for each subscription, then close, no reconnect.
        assert!(effects.iter().any(|e| matches!(
            e,
            ConnEffect::SendFrame(Frame::Complete { id }) if id == "sub-1"
        )));
        assert!(effects.contains(&ConnEffect::CloseTransport));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, ConnEffect::ScheduleReconnect { .. })));
    }

    #[test]
    fn test_complete_removes_subscription_but_keeps_transport() {
        let state = connected_state();
        let (state, _) = transition(
            &state,
            MAX_BACKOFF,
            ConnEvent::SubscribeRequested {
                id: "sub-1".into(),
                payload: payload(),
            },
        );
        let (state, effects) = transition(
            &state,
            MAX_BACKOFF,
            ConnEvent::SubscriptionComplete { id: "sub-1".into() },
        );
        assert_eq!(state.status, ConnStatus::Connected);
        assert!(state.subscriptions.is_empty());
        assert!(effects.is_empty());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let state = connected_state();
        let (_, effects) = transition(&state, MAX_BACKOFF, ConnEvent::PingReceived);
        assert!(matches!(
            effects.as_slice(),
            [ConnEffect::SendFrame(Frame::Pong { .. })]
        ));
    }

    #[test]
    fn test_data_publishes_logs() {
        let state = connected_state();
        let (_, effects) = transition(
            &state,
            MAX_BACKOFF,
            ConnEvent::Data {
                id: "sub-1".into(),
                payload: serde_json::json!({"data": {}}),
            },
        );
        assert!(matches!(
            effects.as_slice(),
            [ConnEffect::PublishLogs { subscription_id, .. }] if subscription_id == "sub-1"
        ));
    }

    #[test]
    fn test_subscription_error_records_last_error() {
        let state = connected_state();
        let (state, _) = transition(
            &state,
            MAX_BACKOFF,
            ConnEvent::SubscribeRequested {
                id: "sub-1".into(),
                payload: payload(),
            },
        );
        let (state, _) = transition(
            &state,
            MAX_BACKOFF,
            ConnEvent::SubscriptionError {
                id: "sub-1".into(),
                message: "unauthorized".into(),
            },
        );
        assert_eq!(state.status, ConnStatus::Connected);
        assert!(state.subscriptions.is_empty());
        assert_eq!(state.last_error.as_deref(), Some("unauthorized"));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn backoff_is_monotone_and_bounded(attempts in 1u32..200) {
            let max = Duration::from_secs(60);
            let current = backoff_for_attempts(attempts, max);
            let next = backoff_for_attempts(attempts + 1, max);
            prop_assert!(current >= INITIAL_BACKOFF);
            prop_assert!(current <= max);
            prop_assert!(next >= current);
        }

        #[test]
        fn attempts_never_go_negative_and_stop_always_resets(
            failures in 0u32..20
        ) {
            let max = Duration::from_secs(60);
            let mut state = MachineState::default();
            for _ in 0..failures {
                let (open, _) = transition(&state, max, ConnEvent::OpenRequested);
                let (failed, _) = transition(
                    &open,
                    max,
                    ConnEvent::TransportFailed { reason: "x".into() },
                );
                state = failed;
            }
            prop_assert_eq!(state.connection_attempts, failures);
            let (stopped, _) = transition(&state, max, ConnEvent::StopRequested);
            prop_assert_eq!(stopped.connection_attempts, 0);
            prop_assert_eq!(stopped.status, ConnStatus::Disconnected);
        }
    }
}
