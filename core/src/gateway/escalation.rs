//! Exit escalation ladder (spec §4.4). Runs on its own clock, independent of
//! the main tick loop (§5).

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationLevel {
    /// Reduce-only limit at mark with a small offset.
    Normal,
    /// Reduce-only limit at a wider offset.
    Aggressive,
    /// Market order for remaining quantity; cancels all other orders on the symbol.
    Emergency,
    /// Market order failed to flatten within `t3`: position goes to `ERROR`.
    Quarantine,
}

impl EscalationLevel {
    pub fn next(self) -> Self {
        match self {
            Self::Normal => Self::Aggressive,
            Self::Aggressive => Self::Emergency,
            Self::Emergency => Self::Quarantine,
            Self::Quarantine => Self::Quarantine,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationTimers {
    pub t1: Duration,
    pub t2: Duration,
    pub t3: Duration,
}

impl Default for EscalationTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_secs(30),
            t2: Duration::from_secs(60),
            t3: Duration::from_secs(90),
        }
    }
}

impl EscalationTimers {
    pub fn wait_for(self, level: EscalationLevel) -> Duration {
        match level {
            EscalationLevel::Normal => self.t1,
            EscalationLevel::Aggressive => self.t2,
            EscalationLevel::Emergency => self.t3,
            EscalationLevel::Quarantine => Duration::ZERO,
        }
    }
}
