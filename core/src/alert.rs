//! `AlertSink` (spec §6.1): best-effort delivery, never blocks the core.
//! Alerts are emitted for every system-level state transition and for every
//! position transition to a terminal state, rate-limited per event type.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertSeverity {
    Info = 0,
    Warning = 1,
    Critical = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertEvent {
    pub kind: &'static str,
    pub message: String,
    pub severity: AlertSeverity,
}

impl AlertEvent {
    pub fn new(kind: &'static str, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
        }
    }
}

/// `send` must never block or fail the caller; implementations swallow their
/// own delivery errors and log instead.
pub trait AlertSink: Send + Sync {
    fn send(&self, event: &AlertEvent, urgent: bool);
}

/// Logs alerts via `tracing`; rate-limits repeats of the same `kind` within a
/// configurable window so a flapping condition doesn't spam the log.
pub struct ConsoleAlertSink {
    rate_limit: Duration,
    last_sent: Mutex<HashMap<&'static str, Instant>>,
}

impl ConsoleAlertSink {
    pub fn new(rate_limit: Duration) -> Self {
        Self {
            rate_limit,
            last_sent: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ConsoleAlertSink {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl AlertSink for ConsoleAlertSink {
    fn send(&self, event: &AlertEvent, urgent: bool) {
        {
            let mut last_sent = self.last_sent.lock();
            if let Some(prev) = last_sent.get(event.kind) {
                if !urgent && prev.elapsed() < self.rate_limit {
                    return;
                }
            }
            last_sent.insert(event.kind, Instant::now());
        }

        match event.severity {
            AlertSeverity::Info => info!(kind = event.kind, "{}", event.message),
            AlertSeverity::Warning => warn!(kind = event.kind, "{}", event.message),
            AlertSeverity::Critical => error!(kind = event.kind, urgent, "{}", event.message),
        }
    }
}

/// Discards every alert. Used in tests where alert delivery is not under
/// test.
#[derive(Debug, Clone, Default)]
pub struct NullAlertSink;

impl AlertSink for NullAlertSink {
    fn send(&self, _event: &AlertEvent, _urgent: bool) {}
}

/// Collects alerts in memory for assertions. Used by integration tests.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    pub events: Mutex<Vec<(AlertEvent, bool)>>,
}

impl AlertSink for RecordingAlertSink {
    fn send(&self, event: &AlertEvent, urgent: bool) {
        self.events.lock().push((event.clone(), urgent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_non_urgent_repeats() {
        let sink = ConsoleAlertSink::new(Duration::from_secs(3600));
        let recording = RecordingAlertSink::default();
        let event = AlertEvent::new("test.kind", AlertSeverity::Warning, "hello");

        sink.send(&event, false);
        sink.send(&event, false);
        recording.send(&event, false);
        recording.send(&event, false);

        assert_eq!(recording.events.lock().len(), 2);
    }
}
