//! Per-service sliding window of recent log events

use crate::db::LogEvent;
use std::collections::VecDeque;

/// Default window size
pub const DEFAULT_WINDOW: usize = 20;

/// Bounded window; pushing past capacity evicts the oldest event.
#[derive(Debug)]
pub struct SlidingWindow {
    events: VecDeque<LogEvent>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, event: LogEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Events oldest-first
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Highest severity score currently in the window
    pub fn max_severity_score(&self) -> u8 {
        self.events
            .iter()
            .map(LogEvent::severity_score)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LogLevel;
    use chrono::Utc;
    use std::collections::HashMap;

    fn event(message: &str, level: LogLevel) -> LogEvent {
        LogEvent {
            service_id: "svc".into(),
            environment_id: None,
            service_name: None,
            timestamp: Utc::now(),
            level,
            message: message.into(),
            raw_metadata: HashMap::new(),
            source: None,
        }
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = SlidingWindow::new(3);
        for i in 0..5 {
            window.push(event(&format!("line {i}"), LogLevel::Info));
        }
        assert_eq!(window.len(), 3);
        let events = window.events();
        assert_eq!(events[0].message, "line 2");
        assert_eq!(events[2].message, "line 4");
    }

    #[test]
    fn test_max_severity_score() {
        let mut window = SlidingWindow::new(4);
        assert_eq!(window.max_severity_score(), 0);
        window.push(event("a", LogLevel::Info));
        window.push(event("b", LogLevel::Error));
        assert_eq!(window.max_severity_score(), 4);
        window.push(event("c", LogLevel::Fatal));
        assert_eq!(window.max_severity_score(), 5);
    }
}
