//! `RiskEngine` (spec §6.1, §4.4): pre-trade gate invoked before the WAL
//! write for `submit_entry`. An external collaborator in principle; a
//! reference implementation ships so the crate is runnable and testable
//! standalone (grounded in the reference codebase's pre-trade validator).

use crate::types::{Side, Symbol};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct TradeIntent {
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub cluster: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioSnapshot {
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub aggregate_open_notional: Decimal,
    pub active_position_count: usize,
    pub day_realized_unrealized_pnl: Decimal,
    pub day_start_equity: Decimal,
    /// Open notional already committed per cluster, keyed the same way as
    /// `TradeIntent::cluster`. Populated by the allocator; an absent key
    /// means zero existing exposure in that cluster.
    pub cluster_open_notional: HashMap<String, Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskRejection {
    PerPositionCapExceeded,
    AggregateNotionalCapExceeded,
    MarginUtilisationExceeded,
    DailyLossLimitBreached,
    SymbolOnCooldown,
    ClusterConcentrationExceeded,
    SystemHalted,
    SystemDegraded,
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PerPositionCapExceeded => "per-position notional cap exceeded",
            Self::AggregateNotionalCapExceeded => "aggregate open notional cap exceeded",
            Self::MarginUtilisationExceeded => "margin utilisation cap exceeded",
            Self::DailyLossLimitBreached => "daily loss limit breached",
            Self::SymbolOnCooldown => "symbol is on entry cooldown",
            Self::ClusterConcentrationExceeded => "cluster concentration cap exceeded",
            Self::SystemHalted => "SYSTEM_HALTED",
            Self::SystemDegraded => "DEGRADED",
        };
        write!(f, "{}", s)
    }
}

pub type RiskResult = Result<(), RiskRejection>;

pub trait RiskEngine: Send + Sync {
    fn validate(&self, intent: &TradeIntent, portfolio: &PortfolioSnapshot) -> RiskResult;

    /// Record that an entry was accepted, starting its cooldown window.
    fn record_entry_accepted(&self, symbol: &Symbol);

    /// Latched by the safety monitor's kill switch (M1/M6 breach, repeated
    /// naked-position detection, operator command). While set, `validate`
    /// rejects every intent with `SystemHalted`.
    fn set_halted(&self, halted: bool);
    fn is_halted(&self) -> bool;

    /// Set by the safety monitor on an M2 (degraded margin) breach. While
    /// set, new entries are rejected but exits and stop replacements are
    /// unaffected (those do not go through `validate`).
    fn set_degraded(&self, degraded: bool);
    fn is_degraded(&self) -> bool;

    /// Symbols currently serving out their post-entry cooldown, for
    /// operator status reporting.
    fn symbols_on_cooldown(&self) -> Vec<Symbol>;
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_single_notional_pct: Decimal,
    pub max_aggregate_notional_pct: Decimal,
    pub max_margin_util_degraded: Decimal,
    pub max_cluster_notional_pct: Decimal,
    pub daily_loss_limit_pct: Decimal,
    pub cooldown: Duration,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_single_notional_pct: Decimal::new(20, 2),   // 20%
            max_aggregate_notional_pct: Decimal::new(80, 2), // 80%
            max_margin_util_degraded: Decimal::new(70, 2),   // 70%
            max_cluster_notional_pct: Decimal::new(40, 2),   // 40%
            daily_loss_limit_pct: Decimal::new(5, 2),        // 5%
            cooldown: Duration::from_secs(4 * 3600),
        }
    }
}

/// Enforces the portfolio and per-symbol caps named in spec §4.4: per-position
/// cap, aggregate notional cap, margin utilisation, daily loss limit,
/// per-symbol cooldown, cluster concentration.
pub struct SimpleRiskEngine {
    limits: RiskLimits,
    cooldowns: Mutex<HashMap<Symbol, Instant>>,
    halted: Mutex<bool>,
    degraded: Mutex<bool>,
}

impl SimpleRiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            cooldowns: Mutex::new(HashMap::new()),
            halted: Mutex::new(false),
            degraded: Mutex::new(false),
        }
    }

    fn on_cooldown(&self, symbol: &Symbol) -> bool {
        let cooldowns = self.cooldowns.lock();
        match cooldowns.get(symbol) {
            Some(last) => last.elapsed() < self.limits.cooldown,
            None => false,
        }
    }
}

impl RiskEngine for SimpleRiskEngine {
    fn validate(&self, intent: &TradeIntent, portfolio: &PortfolioSnapshot) -> RiskResult {
        if *self.halted.lock() {
            return Err(RiskRejection::SystemHalted);
        }
        if *self.degraded.lock() {
            return Err(RiskRejection::SystemDegraded);
        }
        if self.on_cooldown(&intent.symbol) {
            return Err(RiskRejection::SymbolOnCooldown);
        }

        let notional = intent.size * intent.entry_price;
        if portfolio.equity.is_zero() {
            return Err(RiskRejection::PerPositionCapExceeded);
        }

        let position_pct = notional / portfolio.equity;
        if position_pct > self.limits.max_single_notional_pct {
            return Err(RiskRejection::PerPositionCapExceeded);
        }

        let aggregate_pct = (portfolio.aggregate_open_notional + notional) / portfolio.equity;
        if aggregate_pct > self.limits.max_aggregate_notional_pct {
            return Err(RiskRejection::AggregateNotionalCapExceeded);
        }

        let margin_util = portfolio.margin_used / portfolio.equity;
        if margin_util > self.limits.max_margin_util_degraded {
            return Err(RiskRejection::MarginUtilisationExceeded);
        }

        let loss_floor = -self.limits.daily_loss_limit_pct * portfolio.day_start_equity;
        if portfolio.day_realized_unrealized_pnl < loss_floor {
            return Err(RiskRejection::DailyLossLimitBreached);
        }

        if let Some(cluster) = &intent.cluster {
            let existing = portfolio
                .cluster_open_notional
                .get(cluster)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let cluster_pct = (existing + notional) / portfolio.equity;
            if cluster_pct > self.limits.max_cluster_notional_pct {
                return Err(RiskRejection::ClusterConcentrationExceeded);
            }
        }

        Ok(())
    }

    fn record_entry_accepted(&self, symbol: &Symbol) {
        self.cooldowns.lock().insert(symbol.clone(), Instant::now());
    }

    fn set_halted(&self, halted: bool) {
        *self.halted.lock() = halted;
    }

    fn is_halted(&self) -> bool {
        *self.halted.lock()
    }

    fn set_degraded(&self, degraded: bool) {
        *self.degraded.lock() = degraded;
    }

    fn is_degraded(&self) -> bool {
        *self.degraded.lock()
    }

    fn symbols_on_cooldown(&self) -> Vec<Symbol> {
        self.cooldowns
            .lock()
            .iter()
            .filter(|(_, started)| started.elapsed() < self.limits.cooldown)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn portfolio() -> PortfolioSnapshot {
        PortfolioSnapshot {
            equity: dec!(100000),
            margin_used: dec!(10000),
            aggregate_open_notional: dec!(0),
            active_position_count: 0,
            day_realized_unrealized_pnl: dec!(0),
            day_start_equity: dec!(100000),
            cluster_open_notional: HashMap::new(),
        }
    }

    fn intent(size: Decimal, price: Decimal) -> TradeIntent {
        TradeIntent {
            symbol: Symbol::from("BTC/USD"),
            side: Side::Long,
            size,
            entry_price: price,
            cluster: None,
        }
    }

    #[test]
    fn rejects_oversized_position() {
        let engine = SimpleRiskEngine::new(RiskLimits::default());
        let result = engine.validate(&intent(dec!(1), dec!(50000)), &portfolio());
        assert_eq!(result, Err(RiskRejection::PerPositionCapExceeded));
    }

    #[test]
    fn accepts_within_limits() {
        let engine = SimpleRiskEngine::new(RiskLimits::default());
        let result = engine.validate(&intent(dec!(0.1), dec!(50000)), &portfolio());
        assert!(result.is_ok());
    }

    #[test]
    fn enforces_cooldown_after_accepted_entry() {
        let engine = SimpleRiskEngine::new(RiskLimits::default());
        let i = intent(dec!(0.1), dec!(50000));
        assert!(engine.validate(&i, &portfolio()).is_ok());
        engine.record_entry_accepted(&i.symbol);
        assert_eq!(
            engine.validate(&i, &portfolio()),
            Err(RiskRejection::SymbolOnCooldown)
        );
    }

    #[test]
    fn rejects_cluster_concentration_even_under_single_position_cap() {
        let engine = SimpleRiskEngine::new(RiskLimits::default());
        let mut p = portfolio();
        p.cluster_open_notional.insert("l1-majors".to_string(), dec!(35000));
        let mut i = intent(dec!(0.1), dec!(50000));
        i.cluster = Some("l1-majors".to_string());
        // notional is 5000, existing cluster exposure 35000 -> 40% of equity,
        // right at the default cap; nudge over it.
        i.size = dec!(0.11);
        assert_eq!(
            engine.validate(&i, &p),
            Err(RiskRejection::ClusterConcentrationExceeded)
        );
    }

    #[test]
    fn cluster_cap_ignored_without_a_cluster_tag() {
        let engine = SimpleRiskEngine::new(RiskLimits::default());
        let mut p = portfolio();
        p.cluster_open_notional.insert("l1-majors".to_string(), dec!(90000));
        let result = engine.validate(&intent(dec!(0.1), dec!(50000)), &p);
        assert!(result.is_ok());
    }

    #[test]
    fn halted_rejects_everything() {
        let engine = SimpleRiskEngine::new(RiskLimits::default());
        engine.set_halted(true);
        assert_eq!(
            engine.validate(&intent(dec!(0.1), dec!(50000)), &portfolio()),
            Err(RiskRejection::SystemHalted)
        );
    }
}
