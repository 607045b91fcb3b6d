//! Composition root (spec §4.3 startup recovery, §5 tick loop, §6.2 provided
//! interfaces). Wires the Position Registry, Execution Gateway, and
//! Reconciler together over one set of persistence handles and drives the
//! tick loop that keeps the exit escalation ladder and reconciliation
//! running. Not itself a process: an embedding binary owns the actual
//! `tokio::time::interval` loop and calls [`Engine::run_tick`] on it.

use crate::alert::AlertSink;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::CoreError;
use crate::events::ExchangeEvent;
use crate::exchange::ExchangeClient;
use crate::gateway::escalation::EscalationTimers;
use crate::gateway::ExecutionGateway;
use crate::ids::{ClientOrderId, PositionId};
use crate::instrument::InstrumentSpecProvider;
use crate::persistence::{HaltStore, IntentStatus, PositionStore, Wal};
use crate::position::PositionIntent;
use crate::reconciler::kill_switch::KillSwitchTrigger;
use crate::reconciler::Reconciler;
use crate::registry::PositionRegistry;
use crate::risk::{PortfolioSnapshot, RiskEngine, TradeIntent};
use crate::symbol::SymbolCanonicaliser;
use crate::types::{Side, Symbol};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Coarse system health, derived from the halt latch and the risk engine's
/// degraded flag. Mirrors the three-way split the reconciler already
/// enforces (M1 halts, M2 degrades).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Normal,
    Degraded,
    Halted,
}

/// Machine-readable operator status (spec §6.2 `status()`).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub active_positions: usize,
    pub system_state: SystemState,
    pub margin_used_pct: Decimal,
    pub cooldowns: Vec<Symbol>,
    pub last_tick_duration_ms: u64,
}

/// Outcome of the startup recovery protocol, returned for logging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub positions_loaded: usize,
    pub positions_self_archived: usize,
    pub intents_reattached: usize,
    pub intents_failed: usize,
    pub orders_reattached: usize,
}

/// Ties the Position Registry, Execution Gateway, and Reconciler to one
/// tick loop. Built once at startup via [`Engine::bootstrap`], which runs
/// the full recovery protocol (spec §4.3) before returning — no caller can
/// submit a new intent until recovery and one full reconciliation pass have
/// completed.
pub struct Engine {
    registry: Arc<PositionRegistry>,
    gateway: Arc<ExecutionGateway>,
    reconciler: Arc<Reconciler>,
    risk_engine: Arc<dyn RiskEngine>,
    halt_store: Arc<HaltStore>,
    clock: Arc<dyn Clock>,
    escalation_timers: EscalationTimers,
    reconciliation_every_n_ticks: u64,
    soft_tick_deadline_ms: u64,
    tick_counter: AtomicU64,
    last_tick_duration_ms: AtomicU64,
}

impl Engine {
    /// Runs the full startup sequence: opens the persistence handles named
    /// by `config`, replays `positions.jsonl`/the WAL into the registry and
    /// gateway, reattaches every order still resting on the exchange, and
    /// finally runs one full reconciliation pass before returning. Returns
    /// both the constructed `Engine` and a report of what recovery found.
    #[allow(clippy::too_many_arguments)]
    pub async fn bootstrap(
        config: &Config,
        exchange: Arc<dyn ExchangeClient>,
        instruments: Arc<dyn InstrumentSpecProvider>,
        risk_engine: Arc<dyn RiskEngine>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        canonicaliser: Arc<dyn SymbolCanonicaliser>,
    ) -> Result<(Self, RecoveryReport), CoreError> {
        let store = Arc::new(PositionStore::new(&config.persistence.data_dir)?);
        let wal = Arc::new(Wal::open(config.persistence.data_dir.join("wal.jsonl"))?);
        let halt_store = Arc::new(HaltStore::new(&config.persistence.data_dir)?);

        // A restart must come back up halted if it was halted when it went
        // down — the latch file, not process memory, is the source of truth.
        if halt_store.is_latched() {
            risk_engine.set_halted(true);
        }

        let registry = Arc::new(PositionRegistry::new(canonicaliser));

        let mut report = RecoveryReport::default();
        for position in store.load_positions()? {
            report.positions_loaded += 1;
            if position.current_state().is_terminal() {
                // Crashed between snapshotting a terminal state and
                // archiving it: finish the archive now rather than
                // registering a dead position.
                store.archive(&position)?;
                report.positions_self_archived += 1;
                continue;
            }
            registry.register(position)?;
        }

        let gateway = Arc::new(ExecutionGateway::new(
            registry.clone(),
            exchange.clone(),
            instruments,
            risk_engine.clone(),
            alerts.clone(),
            clock.clone(),
            store.clone(),
            wal.clone(),
            config.position,
        ));

        let resting_orders = exchange
            .fetch_open_orders()
            .await
            .map_err(|e| CoreError::ExchangeUnavailable(e.to_string()))?;

        // Reattach every order the exchange still shows resting, regardless
        // of order kind: the gateway's `live_orders` map started empty this
        // process, and the atomic stop-replacement protocol depends on it
        // knowing the currently-live stop.
        for order in &resting_orders {
            if let Ok((position_id, kind, seq)) = ClientOrderId::parse(order.client_order_id.as_str()) {
                gateway.reattach_live_order(&position_id, kind, seq, order.order_id.clone());
                report.orders_reattached += 1;
            }
        }

        // Entry intents are the only ones journaled to the WAL (spec §4.3):
        // resolve each to ACKED if still resting, FAILED otherwise. Fill
        // status for a FAILED-but-actually-filled race is not guessed here —
        // the mandatory reconciliation pass immediately below adopts it via
        // the same race-resolution path it already uses for a live process.
        for intent in wal.open_intents() {
            let still_resting = resting_orders
                .iter()
                .any(|o| o.client_order_id.as_str() == intent.client_order_id);
            if still_resting {
                wal.update_intent(&intent.intent_id, IntentStatus::Acked)?;
                report.intents_reattached += 1;
            } else {
                wal.update_intent(&intent.intent_id, IntentStatus::Failed)?;
                report.intents_failed += 1;
            }
        }

        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            exchange,
            gateway.clone(),
            risk_engine.clone(),
            alerts,
            clock.clone(),
            store,
            halt_store.clone(),
            config.safety.clone(),
            config.reconciliation.clone(),
        ));

        // No new intent is permitted before the registry's view of the world
        // has been cross-checked against exchange truth at least once.
        reconciler.reconcile().await?;

        let engine = Self {
            registry,
            gateway,
            reconciler,
            risk_engine,
            halt_store,
            clock,
            escalation_timers: config.escalation,
            reconciliation_every_n_ticks: 2,
            soft_tick_deadline_ms: config.reconciliation.interval.as_millis() as u64,
            tick_counter: AtomicU64::new(0),
            last_tick_duration_ms: AtomicU64::new(0),
        };
        Ok((engine, report))
    }

    pub fn registry(&self) -> &Arc<PositionRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<ExecutionGateway> {
        &self.gateway
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Spec §6.2 `submit_entry`: pre-trade risk gate, WAL write, order
    /// submission. Delegates straight to the gateway.
    pub async fn submit_entry(
        &self,
        symbol: Symbol,
        side: Side,
        intent: PositionIntent,
        risk_intent: TradeIntent,
        portfolio: &PortfolioSnapshot,
    ) -> Result<PositionId, CoreError> {
        self.gateway.submit_entry(symbol, side, intent, risk_intent, portfolio).await
    }

    /// Spec §6.2 `submit_exit`: an operator- or allocator-initiated flatten,
    /// independent of any exchange event.
    pub async fn submit_exit(&self, position_id: &PositionId) -> Result<(), CoreError> {
        self.gateway.submit_exit(position_id).await
    }

    /// Spec §6.2 `on_exchange_event`: routes a polled or pushed exchange
    /// event to its owning position.
    pub async fn on_exchange_event(&self, symbol: &Symbol, event: ExchangeEvent) -> Result<(), CoreError> {
        self.gateway.on_exchange_event(symbol, event).await
    }

    pub async fn activate_kill_switch(&self, reason: String) -> Result<(), CoreError> {
        self.reconciler.activate_kill_switch(KillSwitchTrigger::Operator, reason).await
    }

    pub fn acknowledge_kill_switch(&self) -> Result<(), CoreError> {
        self.reconciler.acknowledge_kill_switch()
    }

    /// Spec §6.2 `status()`.
    pub fn status(&self) -> StatusReport {
        let system_state = if self.halt_store.is_latched() {
            SystemState::Halted
        } else if self.risk_engine.is_degraded() {
            SystemState::Degraded
        } else {
            SystemState::Normal
        };

        StatusReport {
            active_positions: self.registry.active_count(),
            system_state,
            margin_used_pct: self.reconciler.margin_utilisation(),
            cooldowns: self.risk_engine.symbols_on_cooldown(),
            last_tick_duration_ms: self.last_tick_duration_ms.load(Ordering::Relaxed),
        }
    }

    /// One iteration of the tick loop (spec §5): advances the exit
    /// escalation ladder every tick (it runs on its own clock, independent
    /// of the main cadence) and runs a full reconciliation pass every
    /// `reconciliation_every_n_ticks` ticks. The caller supplies the cadence
    /// via a `tokio::time::interval` or equivalent; `Engine` only defines
    /// what happens on each beat.
    pub async fn run_tick(&self) -> Result<(), CoreError> {
        let t0 = self.clock.now_monotonic();

        self.gateway.run_exit_escalation_tick(self.escalation_timers).await?;

        let n = self.tick_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.reconciliation_every_n_ticks == 0 {
            self.reconciler.reconcile().await?;
        }

        let elapsed_ms = self.clock.now_monotonic().saturating_duration_since(t0).as_millis() as u64;
        self.last_tick_duration_ms.store(elapsed_ms, Ordering::Relaxed);
        if elapsed_ms > self.soft_tick_deadline_ms {
            tracing::warn!(
                elapsed_ms,
                soft_deadline_ms = self.soft_tick_deadline_ms,
                "tick exceeded its soft deadline"
            );
        }
        Ok(())
    }
}
