//! Per-session admission control for spans, events and logs

use crate::config::SessionLimits;
use crate::telemetry::{LogSeverity, SignalType};
use parking_lot::Mutex;
use tracing::debug;

pub trait SignalLimiter: Send + Sync {
    /// Counts a custom span when admitted
    fn should_create_custom_span(&self) -> bool;

    /// Counts a session event when admitted
    fn should_add_session_event(&self, event_type: &SignalType) -> bool;

    /// Counts a log against its severity bucket when admitted
    fn should_create_log(&self, log_type: &SignalType, severity: LogSeverity) -> bool;

    fn should_add_span_event(&self, current_count: usize) -> bool;

    fn should_add_span_link(&self, current_count: usize) -> bool;

    fn should_add_span_attribute(&self, current_count: usize) -> bool;

    /// Reset all counters, called when a session ends
    fn reset(&self);
}

#[derive(Debug, Default)]
struct Counters {
    custom_spans: usize,
    session_events: usize,
    breadcrumbs: usize,
    info_logs: usize,
    warning_logs: usize,
    error_logs: usize,
}

#[derive(Debug, Default)]
pub struct DefaultLimiter {
    limits: SessionLimits,
    counters: Mutex<Counters>,
}

/// Increment `counter` if it is below `limit`
fn admit(counter: &mut usize, limit: usize) -> bool {
    if *counter >= limit {
        return false;
    }
    *counter += 1;
    true
}

impl DefaultLimiter {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn is_unlimited_log_type(log_type: &SignalType) -> bool {
        *log_type == SignalType::internal()
            || *log_type == SignalType::crash()
            || *log_type == SignalType::hang()
    }
}

impl SignalLimiter for DefaultLimiter {
    fn should_create_custom_span(&self) -> bool {
        let admitted = admit(&mut self.counters.lock().custom_spans, self.limits.custom_spans);
        if !admitted {
            debug!("Custom span limit of {} reached", self.limits.custom_spans);
        }
        admitted
    }

    fn should_add_session_event(&self, event_type: &SignalType) -> bool {
        let mut counters = self.counters.lock();
        if *event_type == SignalType::breadcrumb() {
            return match self.limits.breadcrumbs {
                Some(limit) => admit(&mut counters.breadcrumbs, limit),
                None => true,
            };
        }
        admit(&mut counters.session_events, self.limits.session_events)
    }

    fn should_create_log(&self, log_type: &SignalType, severity: LogSeverity) -> bool {
        if Self::is_unlimited_log_type(log_type) {
            return true;
        }

        let mut counters = self.counters.lock();
        let admitted = match severity {
            LogSeverity::Warn => admit(&mut counters.warning_logs, self.limits.warning_logs),
            LogSeverity::Error | LogSeverity::Fatal => {
                admit(&mut counters.error_logs, self.limits.error_logs)
            }
            LogSeverity::Trace | LogSeverity::Debug | LogSeverity::Info => {
                admit(&mut counters.info_logs, self.limits.info_logs)
            }
        };

        if !admitted {
            debug!("Log limit reached for severity {}", severity);
        }
        admitted
    }

    fn should_add_span_event(&self, current_count: usize) -> bool {
        current_count < self.limits.events_per_span
    }

    fn should_add_span_link(&self, current_count: usize) -> bool {
        current_count < self.limits.links_per_span
    }

    fn should_add_span_attribute(&self, current_count: usize) -> bool {
        current_count < self.limits.attributes_per_span
    }

    fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> DefaultLimiter {
        DefaultLimiter::new(SessionLimits {
            custom_spans: 2,
            breadcrumbs: Some(1),
            info_logs: 1,
            warning_logs: 1,
            error_logs: 2,
            events_per_span: 3,
            ..SessionLimits::default()
        })
    }

    #[test]
    fn test_custom_span_limit() {
        let limiter = limiter();
        assert!(limiter.should_create_custom_span());
        assert!(limiter.should_create_custom_span());
        assert!(!limiter.should_create_custom_span());
    }

    #[test]
    fn test_log_buckets_are_independent() {
        let limiter = limiter();
        let message = SignalType::message();
        assert!(limiter.should_create_log(&message, LogSeverity::Info));
        assert!(!limiter.should_create_log(&message, LogSeverity::Debug));
        assert!(limiter.should_create_log(&message, LogSeverity::Warn));
        assert!(!limiter.should_create_log(&message, LogSeverity::Warn));
        assert!(limiter.should_create_log(&message, LogSeverity::Error));
        assert!(limiter.should_create_log(&message, LogSeverity::Fatal));
        assert!(!limiter.should_create_log(&message, LogSeverity::Error));
    }

    #[test]
    fn test_crash_logs_are_unlimited() {
        let limiter = limiter();
        for _ in 0..10 {
            assert!(limiter.should_create_log(&SignalType::crash(), LogSeverity::Fatal));
            assert!(limiter.should_create_log(&SignalType::internal(), LogSeverity::Info));
        }
    }

    #[test]
    fn test_breadcrumb_limit() {
        let limiter = limiter();
        assert!(limiter.should_add_session_event(&SignalType::breadcrumb()));
        assert!(!limiter.should_add_session_event(&SignalType::breadcrumb()));
        assert!(limiter.should_add_session_event(&SignalType::view()));
    }

    #[test]
    fn test_span_caps_use_current_count() {
        let limiter = limiter();
        assert!(limiter.should_add_span_event(2));
        assert!(!limiter.should_add_span_event(3));
    }

    #[test]
    fn test_reset_restores_budget() {
        let limiter = limiter();
        limiter.should_create_custom_span();
        limiter.should_create_custom_span();
        limiter.reset();
        assert!(limiter.should_create_custom_span());
    }
}
