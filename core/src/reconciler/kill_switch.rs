//! Kill switch trigger taxonomy (spec §4.5). The trigger is persisted as a
//! plain string rather than a serialized enum so the on-disk record stays
//! readable and stable even if variants are renamed later.

use crate::persistence::KillSwitchRecord;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchTrigger {
    /// M1 breach: margin utilisation exceeded the hard halt threshold.
    MarginCritical,
    /// M6 breach: daily realised+unrealised P&L breached the loss floor.
    DailyLossBreach,
    /// A position stayed naked through the detection-and-retry window and
    /// the emergency stop placement itself failed.
    RepeatedNakedPosition,
    /// Operator-issued halt via the CLI.
    Operator,
}

pub const TRIGGER_MARGIN_CRITICAL: &str = "MARGIN_CRITICAL";
pub const TRIGGER_DAILY_LOSS_BREACH: &str = "DAILY_LOSS_BREACH";
pub const TRIGGER_REPEATED_NAKED_POSITION: &str = "REPEATED_NAKED_POSITION";
pub const TRIGGER_OPERATOR: &str = "OPERATOR";

impl KillSwitchTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarginCritical => TRIGGER_MARGIN_CRITICAL,
            Self::DailyLossBreach => TRIGGER_DAILY_LOSS_BREACH,
            Self::RepeatedNakedPosition => TRIGGER_REPEATED_NAKED_POSITION,
            Self::Operator => TRIGGER_OPERATOR,
        }
    }
}

/// Only `MarginCritical` triggers are eligible for auto-recovery (spec
/// §4.5); every other trigger requires the operator to delete the halt
/// latch by hand.
pub fn build_record(trigger: KillSwitchTrigger, reason: String, triggered_at: SystemTime) -> KillSwitchRecord {
    KillSwitchRecord {
        trigger: trigger.as_str().to_string(),
        reason,
        triggered_at,
        auto_recoveries: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_margin_critical_trigger_string_matches_auto_recovery_gate() {
        assert_eq!(KillSwitchTrigger::MarginCritical.as_str(), TRIGGER_MARGIN_CRITICAL);
        assert_ne!(KillSwitchTrigger::DailyLossBreach.as_str(), TRIGGER_MARGIN_CRITICAL);
    }
}
