//! Reconciler & Safety Monitor (spec §4.5): the only component that cross-
//! checks internal state against exchange truth, enforces the portfolio-wide
//! invariants M1-M6, and owns the kill switch. Never takes a destructive
//! action (flatten, archive) on a position it does not understand — the cost
//! of a false phantom-flatten is worse than a few extra reconciliation ticks
//! spent confused.

pub mod kill_switch;

use crate::alert::{AlertEvent, AlertSeverity, AlertSink};
use crate::clock::Clock;
use crate::config::{ReconciliationConfig, SafetyConfig};
use crate::error::CoreError;
use crate::events::ExchangeEvent;
use crate::exchange::{AccountSnapshot, ExchangeClient, ExchangePosition};
use crate::gateway::ExecutionGateway;
use crate::ids::ExchangeOrderId;
use crate::persistence::{HaltStore, PositionStore};
use crate::position::ManagedPosition;
use crate::registry::PositionRegistry;
use crate::risk::RiskEngine;
use crate::types::{Side, Symbol};
use dashmap::DashMap;
use kill_switch::KillSwitchTrigger;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Outcome of one reconciliation pass, returned for logging/tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub matched: usize,
    pub orphaned: usize,
    pub phantoms_imported: usize,
    pub races_resolved: usize,
    pub stops_placed: usize,
    pub kill_switch_fired: bool,
}

struct NakedTracker {
    /// Consecutive reconciliation passes this symbol has been observed naked.
    counts: DashMap<Symbol, u32>,
}

impl NakedTracker {
    fn new() -> Self {
        Self { counts: DashMap::new() }
    }

    fn record_naked(&self, symbol: &Symbol) -> u32 {
        let mut entry = self.counts.entry(symbol.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn clear(&self, symbol: &Symbol) {
        self.counts.remove(symbol);
    }
}

fn day_index(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() / 86_400
}

/// Tracks the day's starting equity so M6 (daily loss limit) can be
/// evaluated without a full accounting ledger: the limit is against
/// intraday drawdown from the first equity reading observed each UTC day.
struct DayPnlTracker {
    day_start_equity: parking_lot::Mutex<Option<(u64, Decimal)>>,
}

impl DayPnlTracker {
    fn new() -> Self {
        Self { day_start_equity: parking_lot::Mutex::new(None) }
    }

    fn day_start_equity(&self, now: SystemTime, current_equity: Decimal) -> Decimal {
        let today = day_index(now);
        let mut guard = self.day_start_equity.lock();
        match *guard {
            Some((day, equity)) if day == today => equity,
            _ => {
                *guard = Some((today, current_equity));
                current_equity
            }
        }
    }
}

/// Periodically cross-checks the registry against exchange truth, enforces
/// the portfolio invariants, and owns the kill switch. Reads the gateway to
/// place missing protective stops and to execute kill-switch cancellations.
pub struct Reconciler {
    registry: Arc<PositionRegistry>,
    exchange: Arc<dyn ExchangeClient>,
    gateway: Arc<ExecutionGateway>,
    risk_engine: Arc<dyn RiskEngine>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    store: Arc<PositionStore>,
    halt_store: Arc<HaltStore>,
    safety: SafetyConfig,
    reconciliation: ReconciliationConfig,
    naked: NakedTracker,
    day_pnl: DayPnlTracker,
    started_at: Instant,
    last_universe_size: std::sync::atomic::AtomicUsize,
    auto_recoveries_this_process: AtomicU32,
    last_margin_utilisation: parking_lot::Mutex<Decimal>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<PositionRegistry>,
        exchange: Arc<dyn ExchangeClient>,
        gateway: Arc<ExecutionGateway>,
        risk_engine: Arc<dyn RiskEngine>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        store: Arc<PositionStore>,
        halt_store: Arc<HaltStore>,
        safety: SafetyConfig,
        reconciliation: ReconciliationConfig,
    ) -> Self {
        Self {
            registry,
            exchange,
            gateway,
            risk_engine,
            alerts,
            clock,
            store,
            halt_store,
            safety,
            reconciliation,
            naked: NakedTracker::new(),
            day_pnl: DayPnlTracker::new(),
            started_at: Instant::now(),
            last_universe_size: std::sync::atomic::AtomicUsize::new(0),
            auto_recoveries_this_process: AtomicU32::new(0),
            last_margin_utilisation: parking_lot::Mutex::new(Decimal::ZERO),
        }
    }

    /// Margin utilisation as of the last completed reconciliation pass, for
    /// operator status reporting. Zero before the first pass runs.
    pub fn margin_utilisation(&self) -> Decimal {
        *self.last_margin_utilisation.lock()
    }

    fn in_startup_grace_period(&self) -> bool {
        self.started_at.elapsed() < self.reconciliation.startup_grace_period
    }

    /// One full reconciliation pass (spec §4.5). Pulls exchange positions,
    /// open orders, and account state; classifies every symbol; enforces
    /// stop protection; checks the portfolio invariants; and fires the kill
    /// switch if warranted.
    pub async fn reconcile(&self) -> Result<ReconciliationReport, CoreError> {
        let mut report = ReconciliationReport::default();

        let exchange_positions = self
            .exchange
            .fetch_positions()
            .await
            .map_err(|e| CoreError::ExchangeUnavailable(e.to_string()))?;
        let open_orders = self
            .exchange
            .fetch_open_orders()
            .await
            .map_err(|e| CoreError::ExchangeUnavailable(e.to_string()))?;
        let account = self
            .exchange
            .fetch_account()
            .await
            .map_err(|e| CoreError::ExchangeUnavailable(e.to_string()))?;

        let mut exchange_by_symbol: std::collections::HashMap<Symbol, ExchangePosition> =
            std::collections::HashMap::new();
        for pos in &exchange_positions {
            let symbol = self.registry.canonicalise(&pos.symbol);
            self.gateway.record_mark_price(&symbol, pos.mark_price);
            exchange_by_symbol.insert(symbol, pos.clone());
        }
        self.registry
            .set_known_exchange_symbols(exchange_by_symbol.keys().cloned().collect());

        let active_symbols = self.registry.active_symbols();
        for symbol in &active_symbols {
            let exch = exchange_by_symbol.remove(symbol);
            self.classify_one(symbol, exch, &mut report).await?;
        }
        // Whatever remains in `exchange_by_symbol` has no registry entry: phantom.
        for (symbol, exch) in exchange_by_symbol {
            self.import_phantom(&symbol, &exch).await?;
            report.phantoms_imported += 1;
        }

        if !self.in_startup_grace_period() {
            report.stops_placed += self.enforce_stop_protection(&open_orders).await?;
        }

        let fired = self.check_portfolio_invariants(&account, &exchange_positions).await?;
        report.kill_switch_fired = fired;

        self.try_auto_recover().await?;

        Ok(report)
    }

    async fn classify_one(
        &self,
        symbol: &Symbol,
        exchange_position: Option<ExchangePosition>,
        report: &mut ReconciliationReport,
    ) -> Result<(), CoreError> {
        let Some(handle) = self.registry.get_canonical(symbol) else {
            return Ok(());
        };

        match exchange_position {
            None => {
                // Orphan: registry active, exchange has nothing.
                let mut guard = handle.lock().await;
                if guard.filled_entry_qty().is_zero() {
                    // PENDING with zero filled quantity: the entry simply never
                    // landed. Safe to resolve as cancelled.
                    let _ = guard.apply_event(
                        ExchangeEvent::EntryRejected {
                            order_id: ExchangeOrderId("reconciler-orphan".to_string()),
                            reason: "no corresponding exchange position found".to_string(),
                            event_seq: u64::MAX,
                        },
                        &Default::default(),
                        self.clock.as_ref(),
                    );
                    let snapshot = guard.clone();
                    drop(guard);
                    self.store.snapshot_position(&snapshot)?;
                    self.registry.archive(symbol, snapshot.clone())?;
                    self.store.archive(&snapshot)?;
                } else if guard.mark_orphaned(self.clock.as_ref()).is_ok() {
                    self.store.snapshot_position(&guard)?;
                    drop(guard);
                    report.orphaned += 1;
                    self.alerts.send(
                        &AlertEvent::new(
                            "reconciler.orphan",
                            AlertSeverity::Warning,
                            format!("{} has a registry position with no matching exchange exposure", symbol),
                        ),
                        false,
                    );
                }
                Ok(())
            }
            Some(exch) => {
                let guard = handle.lock().await;
                let is_pending_race = guard.current_state() == crate::types::PositionState::Pending
                    && guard.filled_entry_qty().is_zero()
                    && !exch.qty.is_zero();
                drop(guard);

                if is_pending_race {
                    self.resolve_race(symbol, &handle, &exch).await?;
                    report.races_resolved += 1;
                } else {
                    self.naked.clear(symbol);
                    report.matched += 1;
                }
                Ok(())
            }
        }
    }

    /// A position still `PENDING` in the registry with zero local fills, but
    /// the exchange already reports quantity: the entry fill event raced
    /// reconciliation. Adopt it synthetically rather than leaving the
    /// position stuck.
    async fn resolve_race(
        &self,
        symbol: &Symbol,
        handle: &crate::registry::PositionHandle,
        exch: &ExchangePosition,
    ) -> Result<(), CoreError> {
        let mut guard = handle.lock().await;
        let actions = guard.apply_event(
            ExchangeEvent::EntryFill {
                order_id: ExchangeOrderId("reconciler-race".to_string()),
                fill_id: crate::ids::FillId(format!(
                    "race-{}-{}",
                    symbol.0,
                    self.clock
                        .now_utc()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_nanos()
                )),
                qty: exch.qty,
                price: exch.entry_price,
                event_seq: 1,
            },
            &Default::default(),
            self.clock.as_ref(),
        )?;
        self.store.snapshot_position(&guard)?;
        let position_id = guard.position_id().clone();
        let side = guard.side();
        for action in actions {
            self.gateway.execute_action_locked(&mut guard, &position_id, symbol, side, action).await?;
        }
        self.alerts.send(
            &AlertEvent::new(
                "reconciler.race_resolved",
                AlertSeverity::Info,
                format!("{} adopted exchange fill while still PENDING locally", symbol),
            ),
            false,
        );
        Ok(())
    }

    async fn import_phantom(&self, symbol: &Symbol, exch: &ExchangePosition) -> Result<(), CoreError> {
        let fallback_stop_distance = Decimal::new(2, 2); // 2%
        let stop_price = match exch.side {
            Side::Long => exch.mark_price * (Decimal::ONE - fallback_stop_distance),
            Side::Short => exch.mark_price * (Decimal::ONE + fallback_stop_distance),
        };

        let position_id = crate::ids::PositionId::generate();
        let position = ManagedPosition::from_phantom(
            position_id.clone(),
            symbol.clone(),
            exch.side,
            exch.qty,
            exch.entry_price,
            stop_price,
            self.clock.as_ref(),
        );
        self.store.snapshot_position(&position)?;
        self.registry.register(position)?;

        self.gateway
            .place_initial_protective_stop(&position_id, symbol, exch.side, stop_price, exch.qty)
            .await?;

        self.alerts.send(
            &AlertEvent::new(
                "reconciler.phantom_import",
                AlertSeverity::Warning,
                format!(
                    "{} imported as a phantom position: {:?} {} @ {}, stop placed at {}",
                    symbol, exch.side, exch.qty, exch.entry_price, stop_price
                ),
            ),
            true,
        );
        Ok(())
    }

    /// I-K: every position with filled entry quantity must have a live stop
    /// order on the exchange. First miss logs and waits one interval; a
    /// second consecutive miss places an emergency stop; if that placement
    /// fails the symbol is escalated to the kill switch.
    async fn enforce_stop_protection(
        &self,
        open_orders: &[crate::exchange::ExchangeOrder],
    ) -> Result<usize, CoreError> {
        let mut placed = 0;
        for symbol in self.registry.active_symbols() {
            let Some(handle) = self.registry.get_canonical(&symbol) else { continue };
            let guard = handle.lock().await;
            if guard.filled_entry_qty().is_zero() || guard.current_state().is_terminal() {
                continue;
            }
            let position_id = guard.position_id().clone();
            let side = guard.side();
            let stop_price = guard.current_stop_price();
            let remaining = guard.remaining_qty();
            drop(guard);

            let has_live_stop = open_orders.iter().any(|o| {
                ClientOrderIdOwner::owns_stop(&o.client_order_id, &position_id) && o.price == stop_price
            });

            if has_live_stop {
                self.naked.clear(&symbol);
                continue;
            }

            let detections = self.naked.record_naked(&symbol);
            if detections == 1 {
                self.alerts.send(
                    &AlertEvent::new(
                        "reconciler.naked_detected",
                        AlertSeverity::Warning,
                        format!("{} has no live protective stop; allowing one interval to self-heal", symbol),
                    ),
                    false,
                );
                continue;
            }

            match self
                .gateway
                .place_initial_protective_stop(&position_id, &symbol, side, stop_price, remaining)
                .await
            {
                Ok(()) => {
                    placed += 1;
                    self.naked.clear(&symbol);
                    self.alerts.send(
                        &AlertEvent::new(
                            "reconciler.emergency_stop_placed",
                            AlertSeverity::Critical,
                            format!("{} was naked for {} consecutive checks; emergency stop placed", symbol, detections),
                        ),
                        true,
                    );
                }
                Err(e) => {
                    self.activate_kill_switch(
                        KillSwitchTrigger::RepeatedNakedPosition,
                        format!("{} naked and emergency stop placement failed: {}", symbol, e),
                    )
                    .await?;
                }
            }

            if detections >= self.safety.naked_detections_before_emergency_stop {
                self.naked.clear(&symbol);
            }
        }
        Ok(placed)
    }

    /// M1-M6. Returns whether the kill switch fired as a result of this
    /// check.
    async fn check_portfolio_invariants(
        &self,
        account: &AccountSnapshot,
        exchange_positions: &[ExchangePosition],
    ) -> Result<bool, CoreError> {
        let margin_utilisation = if account.equity.is_zero() {
            Decimal::ZERO
        } else {
            account.margin_used / account.equity
        };
        *self.last_margin_utilisation.lock() = margin_utilisation;

        if margin_utilisation > self.safety.max_margin_util_halt {
            self.activate_kill_switch(
                KillSwitchTrigger::MarginCritical,
                format!(
                    "margin utilisation {} exceeded halt threshold {}",
                    margin_utilisation, self.safety.max_margin_util_halt
                ),
            )
            .await?;
            return Ok(true);
        }

        self.risk_engine
            .set_degraded(margin_utilisation > self.safety.max_margin_util_degraded);

        let day_start_equity = self.day_pnl.day_start_equity(self.clock.now_utc(), account.equity);
        let day_pnl = account.equity - day_start_equity;
        let loss_floor = -(self.safety.daily_loss_limit_pct * day_start_equity);
        if day_pnl < loss_floor {
            self.activate_kill_switch(
                KillSwitchTrigger::DailyLossBreach,
                format!("daily pnl {} breached floor {}", day_pnl, loss_floor),
            )
            .await?;
            return Ok(true);
        }

        if !account.equity.is_zero() {
            let single_notional_floor = self.safety.max_single_notional_pct * account.equity;
            for pos in exchange_positions {
                let notional = pos.qty * pos.mark_price;
                if notional > single_notional_floor {
                    self.alerts.send(
                        &AlertEvent::new(
                            "reconciler.m3_single_notional",
                            AlertSeverity::Warning,
                            format!(
                                "{} notional {} exceeds single-position cap {} of equity (post-trade warning)",
                                pos.symbol, notional, single_notional_floor
                            ),
                        ),
                        false,
                    );
                }
            }

            let aggregate_notional: Decimal = exchange_positions.iter().map(|p| p.qty * p.mark_price).sum();
            let aggregate_floor = self.safety.max_aggregate_notional_pct * account.equity;
            if aggregate_notional > aggregate_floor {
                self.alerts.send(
                    &AlertEvent::new(
                        "reconciler.m4_aggregate_notional",
                        AlertSeverity::Warning,
                        format!(
                            "aggregate open notional {} exceeds cap {} of equity",
                            aggregate_notional, aggregate_floor
                        ),
                    ),
                    false,
                );
            }
        }

        if self.registry.active_count() > self.safety.max_positions {
            self.alerts.send(
                &AlertEvent::new(
                    "reconciler.m5_position_count",
                    AlertSeverity::Warning,
                    format!(
                        "active position count {} exceeds configured max {}",
                        self.registry.active_count(),
                        self.safety.max_positions
                    ),
                ),
                false,
            );
        }

        Ok(false)
    }

    /// Cancels all entry/TP/exit orders, preserving stops, and latches the
    /// halt file. Idempotent: calling this while already halted just
    /// refreshes the record.
    pub async fn activate_kill_switch(&self, trigger: KillSwitchTrigger, reason: String) -> Result<(), CoreError> {
        self.risk_engine.set_halted(true);
        self.gateway.cancel_all_non_protective().await?;

        let record = kill_switch::build_record(trigger, reason.clone(), self.clock.now_utc());
        self.halt_store.write_kill_switch_state(&record)?;
        self.halt_store.write_halt_latch()?;

        self.alerts.send(
            &AlertEvent::new("kill_switch.activated", AlertSeverity::Critical, reason),
            true,
        );
        Ok(())
    }

    /// Manual acknowledgement (operator deletes the latch): clears the halt
    /// and re-permits new entries. Does not touch an existing `degraded`
    /// state, which is re-derived from margin utilisation on the next pass.
    pub fn acknowledge_kill_switch(&self) -> Result<(), CoreError> {
        self.halt_store.clear_halt_latch()?;
        self.risk_engine.set_halted(false);
        self.alerts.send(
            &AlertEvent::new(
                "kill_switch.acknowledged",
                AlertSeverity::Info,
                "kill switch manually acknowledged",
            ),
            false,
        );
        Ok(())
    }

    /// Auto-recovery is restricted to `MARGIN_CRITICAL` triggers: margin back
    /// below the degraded threshold, at least 5 minutes since the trigger,
    /// and no more than 2 auto-recoveries in the trailing 24 hours.
    async fn try_auto_recover(&self) -> Result<(), CoreError> {
        if !self.halt_store.is_latched() {
            return Ok(());
        }
        let Some(record) = self.halt_store.read_kill_switch_state()? else {
            return Ok(());
        };
        if record.trigger != kill_switch::TRIGGER_MARGIN_CRITICAL {
            return Ok(());
        }

        let now = self.clock.now_utc();
        let since_trigger = now.duration_since(record.triggered_at).unwrap_or_default();
        if since_trigger < self.safety.auto_recovery_cooldown {
            return Ok(());
        }

        let day_ago = now
            .checked_sub(std::time::Duration::from_secs(24 * 3600))
            .unwrap_or(UNIX_EPOCH);
        let recoveries_in_window = record.auto_recoveries.iter().filter(|t| **t >= day_ago).count() as u32;
        if recoveries_in_window >= self.safety.auto_recovery_max_per_24h {
            return Ok(());
        }

        let account = self
            .exchange
            .fetch_account()
            .await
            .map_err(|e| CoreError::ExchangeUnavailable(e.to_string()))?;
        let margin_utilisation = if account.equity.is_zero() {
            Decimal::ZERO
        } else {
            account.margin_used / account.equity
        };
        if margin_utilisation >= self.safety.max_margin_util_degraded {
            return Ok(());
        }

        let mut updated = record;
        updated.auto_recoveries.push(now);
        self.halt_store.write_kill_switch_state(&updated)?;
        self.halt_store.clear_halt_latch()?;
        self.risk_engine.set_halted(false);
        self.auto_recoveries_this_process.fetch_add(1, Ordering::Relaxed);

        self.alerts.send(
            &AlertEvent::new(
                "kill_switch.auto_recovered",
                AlertSeverity::Info,
                format!("margin utilisation recovered to {}; kill switch auto-cleared", margin_utilisation),
            ),
            false,
        );
        Ok(())
    }

    /// Rejects a new tradable-universe snapshot smaller than half the
    /// previously accepted one, keeping the old universe in force.
    pub fn accept_universe(&self, candidate_size: usize) -> bool {
        let prior = self.last_universe_size.load(Ordering::Relaxed);
        if prior > 0 {
            let floor = (rust_decimal::prelude::ToPrimitive::to_f64(&self.safety.universe_shrink_floor_pct)
                .unwrap_or(0.5)
                * prior as f64) as usize;
            if candidate_size < floor {
                self.alerts.send(
                    &AlertEvent::new(
                        "reconciler.universe_shrink_rejected",
                        AlertSeverity::Warning,
                        format!(
                            "candidate universe size {} is below the {}-floor of prior size {}; keeping prior universe",
                            candidate_size, floor, prior
                        ),
                    ),
                    false,
                );
                return false;
            }
        }
        self.last_universe_size.store(candidate_size, Ordering::Relaxed);
        true
    }
}

/// Helper for matching an exchange-reported order's client id back to the
/// owning position, without caring about the order kind.
struct ClientOrderIdOwner;

impl ClientOrderIdOwner {
    fn owns_stop(client_order_id: &crate::ids::ClientOrderId, position_id: &crate::ids::PositionId) -> bool {
        match crate::ids::ClientOrderId::parse(client_order_id.as_str()) {
            Ok((pid, kind, _)) => pid == *position_id && kind == crate::ids::OrderKind::Stop,
            Err(_) => false,
        }
    }
}
