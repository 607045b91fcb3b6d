//! Time source abstraction (spec §6.1): monotonic for escalation/cooldown
//! timing, wall-clock (UTC) for persistence timestamps. Injected at
//! construction so tests can control time deterministically.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub trait Clock: Send + Sync + fmt::Debug {
    fn now_monotonic(&self) -> Instant;
    fn now_utc(&self) -> SystemTime;
}

use std::fmt;

/// Real wall/monotonic clock, used in production.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Controllable clock for deterministic tests. `advance` moves both the
/// monotonic and wall-clock readings forward together.
#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeClockState>>,
}

#[derive(Debug)]
struct FakeClockState {
    monotonic_base: Instant,
    elapsed: Duration,
    utc_base: SystemTime,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeClockState {
                monotonic_base: Instant::now(),
                elapsed: Duration::ZERO,
                utc_base: SystemTime::now(),
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock();
        state.elapsed += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now_monotonic(&self) -> Instant {
        let state = self.inner.lock();
        state.monotonic_base + state.elapsed
    }

    fn now_utc(&self) -> SystemTime {
        let state = self.inner.lock();
        state.utc_base + state.elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonic_and_utc_together() {
        let clock = FakeClock::new();
        let m0 = clock.now_monotonic();
        let u0 = clock.now_utc();

        clock.advance(Duration::from_secs(300));

        assert!(clock.now_monotonic() - m0 >= Duration::from_secs(300));
        assert!(clock.now_utc().duration_since(u0).unwrap() >= Duration::from_secs(300));
    }
}
