//! Pattern lane: fast regex signals keyed to severity bands

use crate::db::{LogEvent, RecommendedAction, Severity};
use chrono::Duration as ChronoDuration;
use regex::Regex;
use std::sync::OnceLock;

/// Window for the repeated-timeout rule
const TIMEOUT_BURST_WINDOW_SECS: i64 = 60;
const TIMEOUT_BURST_THRESHOLD: usize = 3;

/// What the pattern lane concluded for a window
#[derive(Debug, Clone, PartialEq)]
pub struct PatternFinding {
    pub severity: Severity,
    pub signal: &'static str,
    pub recommended_action: RecommendedAction,
    /// The message that triggered the finding
    pub matched_message: String,
}

struct Signals {
    oom: Regex,
    connection: Regex,
    server_error: Regex,
    timeout: Regex,
}

fn signals() -> &'static Signals {
    static SIGNALS: OnceLock<Signals> = OnceLock::new();
    SIGNALS.get_or_init(|| Signals {
        oom: Regex::new(r"(?i)fatal|panic|\boom\b|out of memory|killed by oom").unwrap(),
        connection: Regex::new(r"(?i)econnrefused|connection refused|tls handshake failed")
            .unwrap(),
        server_error: Regex::new(
            r"(?i)http 5\d\d|internal server error|exception|traceback|stack ?trace",
        )
        .unwrap(),
        timeout: Regex::new(r"(?i)timeout|deadline exceeded").unwrap(),
    })
}

/// Evaluate the sliding window. Returns the strongest finding, or `None`
/// when no signal fires. Plain `warn`-level noise never escalates on its
/// own; only matching signals do.
pub fn evaluate(window: &[LogEvent]) -> Option<PatternFinding> {
    let s = signals();
    let mut best: Option<PatternFinding> = None;

    for event in window.iter().rev() {
        let candidate = if s.oom.is_match(&event.message) {
            Some(PatternFinding {
                severity: Severity::Critical,
                signal: "oom",
                recommended_action: action_for_oom(&event.message),
                matched_message: event.message.clone(),
            })
        } else if s.connection.is_match(&event.message) {
            Some(PatternFinding {
                severity: Severity::High,
                signal: "connection",
                recommended_action: RecommendedAction::Restart,
                matched_message: event.message.clone(),
            })
        } else if s.server_error.is_match(&event.message) {
            Some(PatternFinding {
                severity: Severity::High,
                signal: "server_error",
                recommended_action: RecommendedAction::Restart,
                matched_message: event.message.clone(),
            })
        } else {
            None
        };

        if let Some(candidate) = candidate {
            match &best {
                Some(current) if current.severity >= candidate.severity => {}
                _ => best = Some(candidate),
            }
        }
    }

    if best.as_ref().is_some_and(|f| f.severity >= Severity::High) {
        return best;
    }

    // Repeated timeouts within the burst window escalate to medium.
    if let Some(newest) = window.last() {
        let cutoff = newest.timestamp - ChronoDuration::seconds(TIMEOUT_BURST_WINDOW_SECS);
        let hits: Vec<&LogEvent> = window
            .iter()
            .filter(|e| e.timestamp >= cutoff && s.timeout.is_match(&e.message))
            .collect();
        if hits.len() >= TIMEOUT_BURST_THRESHOLD {
            let finding = PatternFinding {
                severity: Severity::Medium,
                signal: "timeout_burst",
                recommended_action: RecommendedAction::Restart,
                matched_message: hits.last().map(|e| e.message.clone()).unwrap_or_default(),
            };
            match &best {
                Some(current) if current.severity >= finding.severity => {}
                _ => best = Some(finding),
            }
        }
    }

    best
}

/// OOM with an explicit kill points at memory pressure; a bare fatal/panic
/// is more likely a crash loop worth a restart.
fn action_for_oom(message: &str) -> RecommendedAction {
    static MEMORY: OnceLock<Regex> = OnceLock::new();
    let memory = MEMORY
        .get_or_init(|| Regex::new(r"(?i)\boom\b|out of memory|killed by oom").unwrap());
    if memory.is_match(message) {
        RecommendedAction::ScaleMemory
    } else {
        RecommendedAction::Restart
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LogLevel;
    use chrono::Utc;
    use std::collections::HashMap;

    fn event(level: LogLevel, message: &str, age_secs: i64) -> LogEvent {
        LogEvent {
            service_id: "svc-1".into(),
            environment_id: None,
            service_name: None,
            timestamp: Utc::now() - ChronoDuration::seconds(age_secs),
            level,
            message: message.into(),
            raw_metadata: HashMap::new(),
            source: None,
        }
    }

    #[test]
    fn test_oom_is_critical_with_memory_action() {
        let window = [event(
            LogLevel::Fatal,
            "FATAL: Out of memory - killed by OOM killer",
            0,
        )];
        let finding = evaluate(&window).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.recommended_action, RecommendedAction::ScaleMemory);
    }

    #[test]
    fn test_panic_is_critical_with_restart() {
        let window = [event(LogLevel::Fatal, "panic: runtime error", 0)];
        let finding = evaluate(&window).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.recommended_action, RecommendedAction::Restart);
    }

    #[test]
    fn test_connection_refused_is_high() {
        let window = [event(LogLevel::Error, "connect ECONNREFUSED 10.0.0.1:5432", 0)];
        let finding = evaluate(&window).unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.signal, "connection");
    }

    #[test]
    fn test_http_5xx_is_high() {
        let window = [event(LogLevel::Error, "upstream returned HTTP 503", 0)];
        let finding = evaluate(&window).unwrap();
        assert_eq!(finding.severity, Severity::High);
    }

    #[test]
    fn test_single_timeout_does_not_fire() {
        let window = [event(LogLevel::Error, "request timeout after 30s", 0)];
        assert!(evaluate(&window).is_none());
    }

    #[test]
    fn test_timeout_burst_within_window_is_medium() {
        let window = [
            event(LogLevel::Error, "timeout contacting upstream", 40),
            event(LogLevel::Error, "deadline exceeded", 20),
            event(LogLevel::Error, "timeout contacting upstream", 0),
        ];
        let finding = evaluate(&window).unwrap();
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.signal, "timeout_burst");
    }

    #[test]
    fn test_timeout_burst_outside_window_does_not_fire() {
        let window = [
            event(LogLevel::Error, "timeout contacting upstream", 300),
            event(LogLevel::Error, "timeout contacting upstream", 200),
            event(LogLevel::Error, "timeout contacting upstream", 0),
        ];
        assert!(evaluate(&window).is_none());
    }

    #[test]
    fn test_info_noise_does_not_fire() {
        let window: Vec<LogEvent> = (0..25)
            .map(|i| event(LogLevel::Info, "Starting server on port 4000", i))
            .collect();
        assert!(evaluate(&window).is_none());
    }

    #[test]
    fn test_warn_alone_does_not_escalate() {
        let window = [event(LogLevel::Warn, "cache miss rate elevated", 0)];
        assert!(evaluate(&window).is_none());
    }

    #[test]
    fn test_strongest_signal_wins() {
        let window = [
            event(LogLevel::Error, "connection refused", 10),
            event(LogLevel::Fatal, "killed by OOM killer", 0),
        ];
        let finding = evaluate(&window).unwrap();
        assert_eq!(finding.severity, Severity::Critical);
    }
}
