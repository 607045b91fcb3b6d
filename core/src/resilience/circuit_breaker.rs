//! Circuit breaker guarding new-entry submission against a down exchange
//! (spec §4.4): after `failure_threshold` failures inside `failure_window` the
//! breaker opens and refuses calls until `timeout` elapses, then allows a
//! trial call (half-open) before fully closing again.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(20),
            timeout: Duration::from_secs(10),
            success_threshold: 1,
        }
    }

    pub fn conservative() -> Self {
        Self {
            failure_threshold: 10,
            failure_window: Duration::from_secs(120),
            timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

struct Inner {
    state: CircuitState,
    failures: Vec<Instant>,
    successes_in_half_open: u32,
    opened_at: Option<Instant>,
}

/// Cheaply cloneable (shares state via `Arc`-like internal `Mutex`); every
/// clone observes the same breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            inner: self.inner.clone(),
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: std::sync::Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                successes_in_half_open: 0,
                opened_at: None,
            })),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes_in_half_open = 0;
                }
            }
        }
    }

    /// Whether a new call may be attempted right now.
    pub fn is_call_permitted(&self) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        !matches!(inner.state, CircuitState::Open)
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => {
                inner.failures.clear();
            }
            CircuitState::HalfOpen => {
                inner.successes_in_half_open += 1;
                if inner.successes_in_half_open >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => {
                let now = Instant::now();
                inner.failures.push(now);
                let window = self.config.failure_window;
                inner.failures.retain(|t| now.duration_since(*t) <= window);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.successes_in_half_open = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.successes_in_half_open = 0;
        inner.opened_at = None;
    }

    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            timeout: Duration::from_millis(20),
            success_threshold: 2,
        }
    }

    #[test]
    fn starts_closed_and_permits_calls() {
        let cb = CircuitBreaker::new(test_config());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_call_permitted());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(test_config());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_call_permitted());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn success_clears_failure_count_while_closed() {
        let cb = CircuitBreaker::new(test_config());
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn transitions_to_half_open_after_timeout_then_closes_on_success() {
        let cb = CircuitBreaker::new(test_config());
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_call_permitted());

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn failure_in_half_open_reopens() {
        let cb = CircuitBreaker::new(test_config());
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn reset_restores_closed_state() {
        let cb = CircuitBreaker::new(test_config());
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
