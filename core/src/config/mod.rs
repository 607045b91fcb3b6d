//! Runtime configuration (spec §9 ambient layer): compiled defaults, layered
//! with an optional TOML file and then a handful of environment overrides.
//! Unlike a market-data or strategy process there is no hot path here — a
//! single runtime tier, loaded once at startup, is enough.

use crate::gateway::escalation::EscalationTimers;
use crate::position::PositionConfig;
use crate::risk::RiskLimits;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "could not read config file: {}", e),
            Self::Parse(e) => write!(f, "could not parse config file: {}", e),
            Self::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// How often the safety monitor pulls positions/orders/account.
    pub interval: Duration,
    /// Positions are exempt from orphan/naked-protection checks for this long
    /// after process start, to give the exchange time to report state after a
    /// restart.
    pub startup_grace_period: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            startup_grace_period: Duration::from_secs(90),
        }
    }
}

/// Thresholds enforced by the safety monitor (spec §4.4, M1-M6) plus kill
/// switch / auto-recovery / universe-shrink parameters. `allocator_budget_pct`
/// is validated to sit strictly below `max_margin_util_degraded`, which in
/// turn sits strictly below `max_margin_util_halt` — the allocator's own
/// budget, the degraded warning line, and the hard halt line must never cross.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub allocator_budget_pct: Decimal,
    pub max_margin_util_degraded: Decimal,
    pub max_margin_util_halt: Decimal,
    /// M3 post-trade warning threshold: single-position notional as a
    /// fraction of equity. The hard pre-trade gate lives in `RiskLimits`;
    /// this is the reconciliation-time check against what actually landed.
    pub max_single_notional_pct: Decimal,
    pub max_aggregate_notional_pct: Decimal,
    pub max_positions: usize,
    pub daily_loss_limit_pct: Decimal,
    pub naked_detections_before_emergency_stop: u32,
    pub auto_recovery_cooldown: Duration,
    pub auto_recovery_max_per_24h: u32,
    /// A newly observed tradable universe smaller than this fraction of the
    /// last accepted universe is rejected as a likely data glitch.
    pub universe_shrink_floor_pct: Decimal,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allocator_budget_pct: dec!(0.60),
            max_margin_util_degraded: dec!(0.70),
            max_margin_util_halt: dec!(0.85),
            max_single_notional_pct: dec!(0.20),
            max_aggregate_notional_pct: dec!(0.80),
            max_positions: 20,
            daily_loss_limit_pct: dec!(0.05),
            naked_detections_before_emergency_stop: 2,
            auto_recovery_cooldown: Duration::from_secs(5 * 60),
            auto_recovery_max_per_24h: 2,
            universe_shrink_floor_pct: dec!(0.50),
        }
    }
}

impl SafetyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.allocator_budget_pct < self.max_margin_util_degraded
            && self.max_margin_util_degraded < self.max_margin_util_halt)
        {
            return Err(ConfigError::Invalid(format!(
                "safety thresholds must satisfy allocator_budget_pct ({}) < max_margin_util_degraded ({}) < max_margin_util_halt ({})",
                self.allocator_budget_pct, self.max_margin_util_degraded, self.max_margin_util_halt
            )));
        }
        if self.naked_detections_before_emergency_stop == 0 {
            return Err(ConfigError::Invalid(
                "naked_detections_before_emergency_stop must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub position: PositionConfig,
    pub risk: RiskLimits,
    pub safety: SafetyConfig,
    pub escalation: EscalationTimers,
    pub persistence: PersistenceConfig,
    pub reconciliation: ReconciliationConfig,
}

impl Config {
    /// Loads compiled defaults, then overlays `path` (if it exists) as TOML,
    /// then applies environment overrides, then validates.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// A handful of operationally useful overrides, read directly rather than
    /// through a generic merge — there is no hot path justifying more
    /// machinery than this.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PERP_DATA_DIR") {
            self.persistence.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PERP_SAFETY_MAX_MARGIN_UTIL_HALT") {
            if let Ok(d) = v.parse() {
                self.safety.max_margin_util_halt = d;
            }
        }
        if let Ok(v) = std::env::var("PERP_SAFETY_MAX_MARGIN_UTIL_DEGRADED") {
            if let Ok(d) = v.parse() {
                self.safety.max_margin_util_degraded = d;
            }
        }
        if let Ok(v) = std::env::var("PERP_SAFETY_DAILY_LOSS_LIMIT_PCT") {
            if let Ok(d) = v.parse() {
                self.safety.daily_loss_limit_pct = d;
            }
        }
        if let Ok(v) = std::env::var("PERP_RECONCILIATION_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.reconciliation.interval = Duration::from_secs(secs);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum: Decimal = self.position.tp_splits.iter().sum();
        if sum != Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "position.tp_splits must sum to 1.0, got {}",
                sum
            )));
        }
        self.safety.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_misordered_safety_thresholds() {
        let mut config = Config::default();
        config.safety.max_margin_util_degraded = dec!(0.90);
        config.safety.max_margin_util_halt = dec!(0.85);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_tp_splits_not_summing_to_one() {
        let mut config = Config::default();
        config.position.tp_splits = [dec!(0.5), dec!(0.5), dec!(0.5)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_overlay_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[safety]\nmax_positions = 5\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.safety.max_positions, 5);
        // Untouched fields keep their defaults.
        assert_eq!(config.safety.max_margin_util_halt, dec!(0.85));
    }
}
