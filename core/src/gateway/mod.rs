//! Execution Gateway (spec §4.4): the sole writer to the exchange. Owns
//! client order id allocation, the atomic stop-replacement protocol, the exit
//! escalation ladder, and degraded-mode handling for `EXCHANGE_UNAVAILABLE`.

pub mod escalation;

use crate::actions::Action;
use crate::alert::{AlertEvent, AlertSeverity, AlertSink};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::events::ExchangeEvent;
use crate::exchange::{ExchangeClient, ExchangeError, OrderType};
use crate::ids::{ClientOrderId, ExchangeOrderId, OrderKind, PositionId};
use crate::instrument::InstrumentSpecProvider;
use crate::persistence::{Intent, IntentStatus, PositionStore, Wal};
use crate::position::{ManagedPosition, PositionConfig, PositionIntent};
use crate::registry::PositionRegistry;
use crate::resilience::{BackoffConfig, CircuitBreaker, CircuitBreakerConfig, ExponentialBackoff};
use crate::risk::{PortfolioSnapshot, RiskEngine, TradeIntent};
use crate::types::{Side, Symbol};
use dashmap::DashMap;
use escalation::{EscalationLevel, EscalationTimers};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;

struct ExitEscalationState {
    level: EscalationLevel,
    entered_at: Instant,
}

/// The single writer to the exchange. Holds each Managed Position's registry
/// lock across its own exchange calls (`tokio::sync::Mutex` is
/// `.await`-safe to hold), so a position's actions for one event complete
/// before the next event for that symbol is processed.
pub struct ExecutionGateway {
    registry: Arc<PositionRegistry>,
    exchange: Arc<dyn ExchangeClient>,
    instruments: Arc<dyn InstrumentSpecProvider>,
    risk_engine: Arc<dyn RiskEngine>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    store: Arc<PositionStore>,
    wal: Arc<Wal>,
    position_config: PositionConfig,
    backoff_config: BackoffConfig,
    circuit: CircuitBreaker,
    client_seq: DashMap<(PositionId, OrderKind), u64>,
    live_orders: DashMap<(PositionId, OrderKind), ExchangeOrderId>,
    last_mark_price: DashMap<Symbol, Decimal>,
    exit_escalations: DashMap<PositionId, ExitEscalationState>,
}

impl ExecutionGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<PositionRegistry>,
        exchange: Arc<dyn ExchangeClient>,
        instruments: Arc<dyn InstrumentSpecProvider>,
        risk_engine: Arc<dyn RiskEngine>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        store: Arc<PositionStore>,
        wal: Arc<Wal>,
        position_config: PositionConfig,
    ) -> Self {
        Self {
            registry,
            exchange,
            instruments,
            risk_engine,
            alerts,
            clock,
            store,
            wal,
            position_config,
            backoff_config: BackoffConfig::conservative(),
            circuit: CircuitBreaker::new(CircuitBreakerConfig::default()),
            client_seq: DashMap::new(),
            live_orders: DashMap::new(),
            last_mark_price: DashMap::new(),
            exit_escalations: DashMap::new(),
        }
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    fn spec_for(&self, symbol: &Symbol) -> Result<crate::instrument::InstrumentSpec, CoreError> {
        self.instruments
            .get(symbol)
            .ok_or_else(|| CoreError::InstrumentSpecMissing(symbol.0.clone()))
    }

    fn next_client_order_id(&self, position_id: &PositionId, kind: OrderKind) -> ClientOrderId {
        let mut seq = self
            .client_seq
            .entry((position_id.clone(), kind))
            .or_insert(0);
        *seq += 1;
        ClientOrderId::new(position_id, kind, *seq)
    }

    /// Records the most recently observed exchange mark price for a symbol,
    /// used as the reference for exit-escalation offsets. Fed by the
    /// reconciler's periodic position pull.
    pub fn record_mark_price(&self, symbol: &Symbol, mark_price: Decimal) {
        self.last_mark_price.insert(symbol.clone(), mark_price);
    }

    async fn submit_with_retry(
        &self,
        symbol: &Symbol,
        side: Side,
        order_type: OrderType,
        qty: Decimal,
        price: Option<Decimal>,
        reduce_only: bool,
        client_order_id: &ClientOrderId,
    ) -> Result<crate::exchange::SubmitOrderResult, CoreError> {
        let mut backoff = ExponentialBackoff::with_config(self.backoff_config.clone());
        loop {
            match self
                .exchange
                .submit_order(&symbol.0, side, order_type, qty, price, reduce_only, client_order_id)
                .await
            {
                Ok(result) => {
                    self.circuit.record_success();
                    return Ok(result);
                }
                Err(ExchangeError::Rejected(reason)) => {
                    self.circuit.record_failure();
                    return Err(CoreError::ExchangeRejected(reason));
                }
                Err(ExchangeError::Unavailable(reason)) => {
                    self.circuit.record_failure();
                    match backoff.next_delay() {
                        Some(delay) => {
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        None => return Err(CoreError::ExchangeUnavailable(reason)),
                    }
                }
                Err(ExchangeError::Timeout) => {
                    self.circuit.record_failure();
                    match backoff.next_delay() {
                        Some(delay) => {
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        None => return Err(CoreError::Timeout),
                    }
                }
                Err(ExchangeError::RateLimited) => {
                    self.circuit.record_failure();
                    match backoff.next_delay() {
                        Some(delay) => {
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        None => return Err(CoreError::RateLimited),
                    }
                }
            }
        }
    }

    /// Creates, registers, and submits a new entry. Enforces the pre-trade
    /// risk gate (§4.4) and refuses new entries while the circuit breaker is
    /// open (degraded mode still permits exits and stop replacements, which
    /// do not go through this path).
    pub async fn submit_entry(
        &self,
        symbol: Symbol,
        side: Side,
        intent: PositionIntent,
        risk_intent: TradeIntent,
        portfolio: &PortfolioSnapshot,
    ) -> Result<PositionId, CoreError> {
        if !self.circuit.is_call_permitted() {
            return Err(CoreError::ExchangeUnavailable(
                "circuit breaker open; new entries refused".to_string(),
            ));
        }
        self.risk_engine
            .validate(&risk_intent, portfolio)
            .map_err(|r| CoreError::RejectedByRisk(r.to_string()))?;

        let spec = self.spec_for(&symbol)?;

        let position_id = PositionId::generate();
        let position = ManagedPosition::new(
            position_id.clone(),
            symbol.clone(),
            side,
            intent.clone(),
            self.clock.as_ref(),
        );
        self.registry.register(position)?;

        let client_order_id = self.next_client_order_id(&position_id, OrderKind::Entry);
        let intent_id = crate::ids::IntentId::generate();
        self.wal.write_intent(Intent {
            intent_id: intent_id.clone(),
            position_id: position_id.clone(),
            action_kind: "entry".to_string(),
            client_order_id: client_order_id.as_str().to_string(),
            payload: serde_json::json!({
                "symbol": symbol.0,
                "side": format!("{:?}", side),
                "qty": intent.initial_size,
                "price": intent.initial_entry_price,
            }),
            status: IntentStatus::Pending,
            created_at: self.clock.now_utc(),
        })?;

        let qty = spec.quantise_qty(intent.initial_size);
        let price = spec.quantise_price(intent.initial_entry_price);
        self.wal.update_intent(&intent_id, IntentStatus::Sent)?;

        match self
            .submit_with_retry(&symbol, side, OrderType::Limit, qty, Some(price), false, &client_order_id)
            .await
        {
            Ok(result) => {
                self.live_orders.insert((position_id.clone(), OrderKind::Entry), result.order_id);
                self.wal.update_intent(&intent_id, IntentStatus::Acked)?;
                self.risk_engine.record_entry_accepted(&symbol);
                Ok(position_id)
            }
            Err(e) => {
                self.wal.update_intent(&intent_id, IntentStatus::Failed)?;
                // Nothing was ever acked by the exchange: resolve the position
                // to CANCELLED via a synthetic rejection rather than leaving
                // it stuck in PENDING with no corresponding order.
                if let Some(handle) = self.registry.get_canonical(&symbol) {
                    let mut guard = handle.lock().await;
                    let _ = guard.apply_event(
                        ExchangeEvent::EntryRejected {
                            order_id: ExchangeOrderId(client_order_id.as_str().to_string()),
                            reason: e.to_string(),
                            event_seq: 1,
                        },
                        &self.position_config,
                        self.clock.as_ref(),
                    );
                    let snapshot = guard.clone();
                    drop(guard);
                    let _ = self.registry.archive(&symbol, snapshot.clone());
                    let _ = self.store.archive(&snapshot);
                }
                Err(e)
            }
        }
    }

    /// Re-establishes the gateway's in-memory order bookkeeping for an order
    /// that was already resting on the exchange before this process started
    /// (spec §4.3 startup recovery). Advances `client_seq` past the recovered
    /// sequence number so a fresh order for the same `(position_id, kind)`
    /// never collides with it.
    pub(crate) fn reattach_live_order(
        &self,
        position_id: &PositionId,
        kind: OrderKind,
        seq: u64,
        order_id: ExchangeOrderId,
    ) {
        self.live_orders.insert((position_id.clone(), kind), order_id);
        let mut entry = self.client_seq.entry((position_id.clone(), kind)).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Delivers an operator- or strategy-initiated exit request directly to
    /// the position by id, bypassing the by-symbol registry lookup used for
    /// exchange-sourced events (spec §6.2 `submit_exit`). The position need
    /// not be resolvable by symbol alone when multiple historical positions
    /// share it; by-id lookup via the registry's client-order-id index is
    /// exact.
    pub async fn submit_exit(&self, position_id: &PositionId) -> Result<(), CoreError> {
        let handle = self
            .registry
            .get_by_id(position_id)
            .ok_or_else(|| CoreError::Integrity(format!("no active position {}", position_id)))?;
        let mut guard = handle.lock().await;
        let symbol = guard.symbol().clone();
        let side = guard.side();

        let actions = guard.apply_event(ExchangeEvent::ExitRequested, &self.position_config, self.clock.as_ref())?;
        self.store.snapshot_position(&guard)?;

        let pid = guard.position_id().clone();
        for action in actions {
            self.execute_action_locked(&mut guard, &pid, &symbol, side, action).await?;
        }

        if guard.current_state().is_terminal() {
            let snapshot = guard.clone();
            drop(guard);
            self.exit_escalations.remove(&pid);
            self.registry.archive(&symbol, snapshot.clone())?;
            self.store.archive(&snapshot)?;
        }
        Ok(())
    }

    /// Routes an exchange event to the owning position (resolved via the
    /// registry) and executes whatever follow-up actions it returns, while
    /// still holding the position's lock.
    pub async fn on_exchange_event(&self, symbol: &Symbol, event: ExchangeEvent) -> Result<(), CoreError> {
        let handle = self
            .registry
            .get_canonical(symbol)
            .ok_or_else(|| CoreError::UnknownSymbol(symbol.0.clone()))?;
        let mut guard = handle.lock().await;

        let actions = guard.apply_event(event, &self.position_config, self.clock.as_ref())?;
        self.store.snapshot_position(&guard)?;

        let position_id = guard.position_id().clone();
        let side = guard.side();
        for action in actions {
            self.execute_action_locked(&mut guard, &position_id, symbol, side, action).await?;
        }

        if guard.current_state().is_terminal() {
            let snapshot = guard.clone();
            drop(guard);
            self.exit_escalations.remove(&position_id);
            self.registry.archive(symbol, snapshot.clone())?;
            self.store.archive(&snapshot)?;
            self.alerts.send(
                &AlertEvent::new(
                    "position.terminal",
                    AlertSeverity::Info,
                    format!("{} reached {}", position_id, snapshot.current_state()),
                ),
                false,
            );
        }

        Ok(())
    }

    /// Executes one follow-up action while the caller holds the position's
    /// lock. Exposed at `pub(crate)` visibility so the reconciler can drive
    /// actions emitted by its own synthetic events (race resolution) through
    /// the same path as the normal event-routing loop.
    pub(crate) async fn execute_action_locked(
        &self,
        guard: &mut ManagedPosition,
        position_id: &PositionId,
        symbol: &Symbol,
        side: Side,
        action: Action,
    ) -> Result<(), CoreError> {
        match action {
            Action::PlaceEntry | Action::NoAction => Ok(()),
            Action::PlaceStop { price } => {
                let qty = guard.remaining_qty();
                self.place_stop(position_id, symbol, side, price, qty).await
            }
            Action::ReplaceStop { new_price } => {
                let qty = guard.remaining_qty();
                self.replace_stop_atomic(position_id, symbol, side, new_price, qty).await
            }
            Action::PlaceTpLadder { prices, qty_splits } => {
                self.place_tp_ladder(position_id, symbol, side, prices, qty_splits).await
            }
            Action::CancelTp { tp_index } => self.cancel_tp(position_id, tp_index).await,
            Action::PartialClose { qty } => self.partial_close(position_id, symbol, side, qty).await,
            Action::FlattenNow => {
                let qty = guard.remaining_qty();
                self.start_flatten(position_id, symbol, side, qty).await
            }
        }
    }

    /// Places a stop for a position that has none resting on the exchange
    /// yet: the reconciler's phantom-import and emergency-stop-placement
    /// paths, which have no prior `Action::PlaceStop` to react to.
    pub async fn place_initial_protective_stop(
        &self,
        position_id: &PositionId,
        symbol: &Symbol,
        side: Side,
        price: Decimal,
        qty: Decimal,
    ) -> Result<(), CoreError> {
        self.place_stop(position_id, symbol, side, price, qty).await
    }

    async fn place_stop(
        &self,
        position_id: &PositionId,
        symbol: &Symbol,
        side: Side,
        price: Decimal,
        qty: Decimal,
    ) -> Result<(), CoreError> {
        let spec = self.spec_for(symbol)?;
        let price = spec.quantise_price(price);
        let qty = spec.quantise_qty(qty);
        let client_id = self.next_client_order_id(position_id, OrderKind::Stop);
        let result = self
            .submit_with_retry(symbol, side.opposite(), OrderType::Limit, qty, Some(price), true, &client_id)
            .await?;
        self.live_orders.insert((position_id.clone(), OrderKind::Stop), result.order_id);
        Ok(())
    }

    /// New-stop-then-cancel-old-stop ordering (spec §4.4): never cancels the
    /// live stop before the replacement is acked, so the position is never
    /// naked between the two calls. A failure to submit the new stop aborts
    /// before touching the old one; a failure to cancel the superseded stop
    /// is logged but not fatal.
    async fn replace_stop_atomic(
        &self,
        position_id: &PositionId,
        symbol: &Symbol,
        side: Side,
        new_price: Decimal,
        qty: Decimal,
    ) -> Result<(), CoreError> {
        let spec = self.spec_for(symbol)?;
        let price = spec.quantise_price(new_price);
        let qty = spec.quantise_qty(qty);
        let old_order_id = self
            .live_orders
            .get(&(position_id.clone(), OrderKind::Stop))
            .map(|r| r.value().clone());

        let client_id = self.next_client_order_id(position_id, OrderKind::Stop);
        let result = self
            .submit_with_retry(symbol, side.opposite(), OrderType::Limit, qty, Some(price), true, &client_id)
            .await?;
        self.live_orders.insert((position_id.clone(), OrderKind::Stop), result.order_id);

        if let Some(old_id) = old_order_id {
            if let Err(e) = self.exchange.cancel_order(&old_id).await {
                tracing::warn!(
                    position_id = %position_id,
                    old_order_id = %old_id,
                    error = %e,
                    "failed to cancel superseded stop order; leaving it resting"
                );
            }
        }
        Ok(())
    }

    async fn place_tp_ladder(
        &self,
        position_id: &PositionId,
        symbol: &Symbol,
        side: Side,
        prices: [Decimal; 3],
        qty_splits: [Decimal; 3],
    ) -> Result<(), CoreError> {
        let spec = self.spec_for(symbol)?;
        for (i, (price, qty)) in prices.iter().zip(qty_splits.iter()).enumerate() {
            if qty.is_zero() {
                continue;
            }
            let kind = OrderKind::from_tp_index((i + 1) as u8)
                .ok_or_else(|| CoreError::Integrity(format!("invalid tp index {}", i + 1)))?;
            let client_id = self.next_client_order_id(position_id, kind);
            let price = spec.quantise_price(*price);
            let qty = spec.quantise_qty(*qty);
            let result = self
                .submit_with_retry(symbol, side.opposite(), OrderType::Limit, qty, Some(price), true, &client_id)
                .await?;
            self.live_orders.insert((position_id.clone(), kind), result.order_id);
        }
        Ok(())
    }

    async fn cancel_tp(&self, position_id: &PositionId, tp_index: u8) -> Result<(), CoreError> {
        let kind = OrderKind::from_tp_index(tp_index)
            .ok_or_else(|| CoreError::Integrity(format!("invalid tp index {}", tp_index)))?;
        if let Some((_, order_id)) = self.live_orders.remove(&(position_id.clone(), kind)) {
            if let Err(e) = self.exchange.cancel_order(&order_id).await {
                tracing::warn!(position_id = %position_id, tp_index, error = %e, "failed to cancel tp order");
            }
        }
        Ok(())
    }

    async fn partial_close(
        &self,
        position_id: &PositionId,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
    ) -> Result<(), CoreError> {
        let spec = self.spec_for(symbol)?;
        let qty = spec.quantise_qty(qty);
        let client_id = self.next_client_order_id(position_id, OrderKind::Exit);
        let result = self
            .submit_with_retry(symbol, side.opposite(), OrderType::Market, qty, None, true, &client_id)
            .await?;
        self.live_orders.insert((position_id.clone(), OrderKind::Exit), result.order_id);
        Ok(())
    }

    /// Level 1 of the exit escalation ladder (spec §4.4): a reduce-only limit
    /// at a small offset from the last known mark. Registers the position
    /// with the escalation tracker so `run_exit_escalation_tick` can advance
    /// it through the remaining levels on its own clock.
    async fn start_flatten(
        &self,
        position_id: &PositionId,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
    ) -> Result<(), CoreError> {
        if qty.is_zero() {
            return Ok(());
        }
        let mark = self
            .last_mark_price
            .get(symbol)
            .map(|r| *r.value())
            .unwrap_or(Decimal::ZERO);
        let offset = mark * Decimal::new(5, 4); // 5 bps
        let price = match side {
            Side::Long => mark - offset,
            Side::Short => mark + offset,
        };
        self.exit_escalations.insert(
            position_id.clone(),
            ExitEscalationState {
                level: EscalationLevel::Normal,
                entered_at: Instant::now(),
            },
        );
        if mark.is_zero() {
            // No mark known yet: go straight to market rather than resting an
            // order at price zero.
            return self.partial_close(position_id, symbol, side, qty).await;
        }
        self.place_reduce_only_limit(position_id, symbol, side, price, qty, OrderKind::Exit)
            .await
    }

    async fn place_reduce_only_limit(
        &self,
        position_id: &PositionId,
        symbol: &Symbol,
        side: Side,
        price: Decimal,
        qty: Decimal,
        kind: OrderKind,
    ) -> Result<(), CoreError> {
        let spec = self.spec_for(symbol)?;
        let price = spec.quantise_price(price);
        let qty = spec.quantise_qty(qty);
        let client_id = self.next_client_order_id(position_id, kind);
        let result = self
            .submit_with_retry(symbol, side.opposite(), OrderType::Limit, qty, Some(price), true, &client_id)
            .await?;
        self.live_orders.insert((position_id.clone(), kind), result.order_id);
        Ok(())
    }

    /// Advances every tracked exit through the escalation ladder (spec §4.4):
    /// `t1` widens the offset, `t2` goes to market and cancels every other
    /// resting order on the symbol, `t3` with the position still open is a
    /// quarantine condition — the position is marked `ERROR` and surfaced to
    /// the operator. Driven by the engine's tick loop on its own cadence,
    /// independent of the exchange-event stream (spec §5).
    pub async fn run_exit_escalation_tick(&self, timers: EscalationTimers) -> Result<(), CoreError> {
        let pending: Vec<PositionId> = self.exit_escalations.iter().map(|e| e.key().clone()).collect();
        for position_id in pending {
            self.advance_one_escalation(&position_id, timers).await?;
        }
        Ok(())
    }

    async fn advance_one_escalation(
        &self,
        position_id: &PositionId,
        timers: EscalationTimers,
    ) -> Result<(), CoreError> {
        let due = {
            let Some(state) = self.exit_escalations.get(position_id) else {
                return Ok(());
            };
            state.entered_at.elapsed() >= timers.wait_for(state.level)
        };
        if !due {
            return Ok(());
        }

        let Some(handle) = self.registry.get_by_id(position_id) else {
            self.exit_escalations.remove(position_id);
            return Ok(());
        };
        let mut guard = handle.lock().await;
        if guard.current_state().is_terminal() {
            self.exit_escalations.remove(position_id);
            return Ok(());
        }
        let symbol = guard.symbol().clone();
        let side = guard.side();
        let qty = guard.remaining_qty();

        let next_level = self
            .exit_escalations
            .get(position_id)
            .map(|s| s.level.next())
            .unwrap_or(EscalationLevel::Quarantine);

        match next_level {
            EscalationLevel::Aggressive => {
                let mark = self.last_mark_price.get(&symbol).map(|r| *r.value()).unwrap_or(Decimal::ZERO);
                let offset = mark * Decimal::new(25, 4); // 25 bps, wider than level 1
                let price = match side {
                    Side::Long => mark - offset,
                    Side::Short => mark + offset,
                };
                if let Some((_, old)) = self.live_orders.remove(&(position_id.clone(), OrderKind::Exit)) {
                    let _ = self.exchange.cancel_order(&old).await;
                }
                self.place_reduce_only_limit(position_id, &symbol, side, price, qty, OrderKind::Exit)
                    .await?;
            }
            EscalationLevel::Emergency => {
                self.cancel_all_orders_for_symbol_except(&symbol, position_id, OrderKind::Stop).await;
                self.partial_close(position_id, &symbol, side, qty).await?;
            }
            EscalationLevel::Quarantine => {
                guard.mark_error(self.clock.as_ref());
                let snapshot = guard.clone();
                drop(guard);
                self.store.snapshot_position(&snapshot)?;
                self.registry.archive(&symbol, snapshot.clone())?;
                self.store.archive(&snapshot)?;
                self.exit_escalations.remove(position_id);
                self.alerts.send(
                    &AlertEvent::new(
                        "position.exit_quarantine",
                        AlertSeverity::Critical,
                        format!("{} failed to flatten within the exit escalation ladder", position_id),
                    ),
                    true,
                );
                return Ok(());
            }
            EscalationLevel::Normal => {}
        }

        self.exit_escalations.insert(
            position_id.clone(),
            ExitEscalationState {
                level: next_level,
                entered_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn cancel_all_orders_for_symbol_except(
        &self,
        _symbol: &Symbol,
        position_id: &PositionId,
        preserve: OrderKind,
    ) {
        for kind in [OrderKind::Entry, OrderKind::Tp1, OrderKind::Tp2, OrderKind::Tp3, OrderKind::Exit] {
            if kind == preserve {
                continue;
            }
            if let Some((_, order_id)) = self.live_orders.remove(&(position_id.clone(), kind)) {
                let _ = self.exchange.cancel_order(&order_id).await;
            }
        }
    }

    /// Kill-switch action (spec §4.4): cancels every working order except
    /// protective stops, for every active position.
    pub async fn cancel_all_non_protective(&self) -> Result<(), CoreError> {
        for symbol in self.registry.active_symbols() {
            let Some(handle) = self.registry.get_canonical(&symbol) else {
                continue;
            };
            let position_id = {
                let guard = handle.lock().await;
                guard.position_id().clone()
            };
            for kind in [OrderKind::Entry, OrderKind::Tp1, OrderKind::Tp2, OrderKind::Tp3, OrderKind::Exit] {
                if let Some((_, order_id)) = self.live_orders.remove(&(position_id.clone(), kind)) {
                    if let Err(e) = self.exchange.cancel_order(&order_id).await {
                        tracing::warn!(position_id = %position_id, error = %e, "failed to cancel order during kill switch");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::NullAlertSink;
    use crate::clock::FakeClock;
    use crate::exchange::{FakeExchangeClient, OrderStatus};
    use crate::instrument::{InstrumentSpec, StaticInstrumentTable};
    use crate::risk::{PortfolioSnapshot, RiskLimits, SimpleRiskEngine};
    use crate::symbol::DefaultCanonicaliser;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn btc_usd_spec() -> InstrumentSpec {
        InstrumentSpec {
            tick_size: dec!(0.5),
            qty_step: dec!(0.001),
            min_qty: dec!(0.001),
            contract_size: dec!(1),
        }
    }

    struct Harness {
        gateway: Arc<ExecutionGateway>,
        registry: Arc<PositionRegistry>,
        exchange: Arc<FakeExchangeClient>,
        risk_engine: Arc<SimpleRiskEngine>,
        clock: Arc<FakeClock>,
        _tempdir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let tempdir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PositionRegistry::new(Arc::new(DefaultCanonicaliser)));
        let exchange = Arc::new(FakeExchangeClient::new());
        let instruments = Arc::new(StaticInstrumentTable::new().with_spec(Symbol::from("BTC/USD"), btc_usd_spec()));
        let risk_engine = Arc::new(SimpleRiskEngine::new(RiskLimits::default()));
        let alerts = Arc::new(NullAlertSink);
        let clock = Arc::new(FakeClock::new());
        let store = Arc::new(PositionStore::new(tempdir.path().join("positions")).unwrap());
        let wal = Arc::new(Wal::open(tempdir.path().join("wal.jsonl")).unwrap());

        let gateway = Arc::new(ExecutionGateway::new(
            registry.clone(),
            exchange.clone(),
            instruments,
            risk_engine.clone(),
            alerts,
            clock.clone(),
            store,
            wal,
            PositionConfig::default(),
        ));

        Harness {
            gateway,
            registry,
            exchange,
            risk_engine,
            clock,
            _tempdir: tempdir,
        }
    }

    fn intent() -> PositionIntent {
        PositionIntent {
            initial_size: dec!(1.0),
            initial_entry_price: dec!(50000),
            initial_stop_price: dec!(49000),
            initial_tp_prices: [dec!(50500), dec!(51000), dec!(52000)],
            entry_score: dec!(1),
            cluster: None,
            initial_stop_distance_pct: dec!(0.02),
            margin_used_at_entry: dec!(5000),
            atr_at_entry: None,
        }
    }

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

    fn risk_intent() -> TradeIntent {
        TradeIntent {
            symbol: Symbol::from("BTC/USD"),
            side: Side::Long,
            size: dec!(1.0),
            entry_price: dec!(50000),
            cluster: None,
        }
    }

    #[tokio::test]
    async fn submit_entry_registers_and_sends_a_limit_order() {
        let h = harness();
        let symbol = Symbol::from("BTC/USD");
        let position_id = h
            .gateway
            .submit_entry(symbol.clone(), Side::Long, intent(), risk_intent(), &portfolio())
            .await
            .unwrap();

        assert!(h.registry.get_canonical(&symbol).is_some());
        let open = h.exchange.fetch_open_orders().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].client_order_id.as_str(), format!("{}:entry:1", position_id));
    }

    #[tokio::test]
    async fn submit_entry_refused_while_risk_engine_halted() {
        let h = harness();
        h.risk_engine.set_halted(true);
        let symbol = Symbol::from("BTC/USD");
        let result = h
            .gateway
            .submit_entry(symbol, Side::Long, intent(), risk_intent(), &portfolio())
            .await;
        assert!(matches!(result, Err(CoreError::RejectedByRisk(_))));
    }

    async fn fill_entry_and_place_protective_orders(h: &Harness, symbol: &Symbol) -> PositionId {
        let position_id = h
            .gateway
            .submit_entry(symbol.clone(), Side::Long, intent(), risk_intent(), &portfolio())
            .await
            .unwrap();

        let open = h.exchange.fetch_open_orders().await.unwrap();
        let entry_order = open.iter().find(|o| o.client_order_id.as_str().ends_with(":entry:1")).unwrap();
        h.gateway
            .on_exchange_event(
                symbol,
                ExchangeEvent::EntryFill {
                    order_id: entry_order.order_id.clone(),
                    fill_id: crate::ids::FillId("fill-1".to_string()),
                    qty: dec!(1.0),
                    price: dec!(50000),
                    event_seq: 1,
                },
            )
            .await
            .unwrap();
        position_id
    }

    #[tokio::test]
    async fn entry_fill_places_stop_and_tp_ladder() {
        let h = harness();
        let symbol = Symbol::from("BTC/USD");
        fill_entry_and_place_protective_orders(&h, &symbol).await;

        let open = h.exchange.fetch_open_orders().await.unwrap();
        // entry (now filled/removed from open-orders accounting in the fake
        // only via status change, which this test doesn't perform) plus stop
        // and three tp orders.
        let stop_count = open.iter().filter(|o| o.client_order_id.as_str().contains(":stop:")).count();
        let tp_count = open.iter().filter(|o| o.client_order_id.as_str().contains(":tp")).count();
        assert_eq!(stop_count, 1);
        assert_eq!(tp_count, 3);
    }

    #[tokio::test]
    async fn stop_replacement_failure_leaves_old_stop_resting() {
        let h = harness();
        let symbol = Symbol::from("BTC/USD");
        fill_entry_and_place_protective_orders(&h, &symbol).await;

        let before = h.exchange.fetch_open_orders().await.unwrap();
        let old_stop = before.iter().find(|o| o.client_order_id.as_str().contains(":stop:")).unwrap().clone();

        let tp1_order = before.iter().find(|o| o.client_order_id.as_str().contains(":tp1:")).unwrap().clone();

        // The stop's replacement (break-even move) will be triggered by the
        // tp1 fill; force the new-stop submission to fail.
        h.exchange.reject_next_submit();

        let result = h
            .gateway
            .on_exchange_event(
                &symbol,
                ExchangeEvent::TpFill {
                    tp_index: 1,
                    order_id: tp1_order.order_id.clone(),
                    fill_id: crate::ids::FillId("fill-tp1".to_string()),
                    qty: dec!(0.4),
                    price: dec!(50500),
                    event_seq: 2,
                },
            )
            .await;
        assert!(result.is_err());

        // The old stop order was never touched: cancel_order is only called
        // after the new stop is confirmed, and the new stop submission
        // failed before reaching that point.
        let still_resting = h.exchange.order(&old_stop.order_id).unwrap();
        assert_eq!(still_resting.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn kill_switch_cancels_non_protective_but_preserves_stop() {
        let h = harness();
        let symbol = Symbol::from("BTC/USD");
        fill_entry_and_place_protective_orders(&h, &symbol).await;

        h.gateway.cancel_all_non_protective().await.unwrap();

        let open = h.exchange.fetch_open_orders().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].client_order_id.as_str().contains(":stop:"));
    }

    #[tokio::test]
    async fn exit_escalation_ladder_advances_and_quarantines_on_exhaustion() {
        let h = harness();
        let symbol = Symbol::from("BTC/USD");
        fill_entry_and_place_protective_orders(&h, &symbol).await;
        h.gateway.record_mark_price(&symbol, dec!(50000));

        h.gateway.on_exchange_event(&symbol, ExchangeEvent::ExitRequested).await.unwrap();
        assert!(h.gateway.exit_escalations.contains_key(
            &h.registry.get_canonical(&symbol).unwrap().lock().await.position_id().clone()
        ));

        let zero_timers = EscalationTimers {
            t1: std::time::Duration::ZERO,
            t2: std::time::Duration::ZERO,
            t3: std::time::Duration::ZERO,
        };

        // Normal -> Aggressive -> Emergency -> Quarantine.
        for _ in 0..3 {
            h.gateway.run_exit_escalation_tick(zero_timers).await.unwrap();
        }

        assert!(h.registry.get_canonical(&symbol).is_none());
        let _ = h.clock;
    }
}
