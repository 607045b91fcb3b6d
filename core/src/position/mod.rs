//! The Managed Position state machine (spec §4.2).
//!
//! `apply_event` is the only mutator. State transitions are caused only by
//! exchange events (I-F); the position never calls back into the gateway —
//! it returns an ordered list of follow-up [`Action`]s instead.

use crate::actions::Action;
use crate::clock::Clock;
use crate::error::{InvariantError, PositionError};
use crate::events::{EventSeq, ExchangeEvent};
use crate::ids::{ExchangeOrderId, PositionId};
use crate::types::{FillRecord, PositionState, Side, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

/// Requested parameters for a new entry. `initial_*` fields become immutable
/// (I-C) once the entry is fully acknowledged by a fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionIntent {
    pub initial_size: Decimal,
    pub initial_entry_price: Decimal,
    pub initial_stop_price: Decimal,
    pub initial_tp_prices: [Decimal; 3],
    pub entry_score: Decimal,
    pub cluster: Option<String>,
    pub initial_stop_distance_pct: Decimal,
    pub margin_used_at_entry: Decimal,
    pub atr_at_entry: Option<Decimal>,
}

/// Runtime-tunable parameters consulted while applying events. Owned by
/// configuration, not by the position itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    /// `[tp1_fraction, tp2_fraction, runner_fraction]`, must sum to 1.0.
    pub tp_splits: [Decimal; 3],
    pub min_partial_for_be: Decimal,
    pub trailing_activation_atr_min: Option<Decimal>,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            tp_splits: [Decimal::new(4, 1), Decimal::new(4, 1), Decimal::new(2, 1)],
            min_partial_for_be: Decimal::new(3, 1),
            trailing_activation_atr_min: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedPosition {
    position_id: PositionId,
    symbol: Symbol,
    side: Side,
    state: PositionState,

    intent: PositionIntent,

    current_stop_price: Decimal,
    tp_filled_flags: [bool; 3],
    break_even_triggered: bool,
    trailing_active: bool,

    fills: Vec<FillRecord>,
    processed_event_hashes: HashSet<String>,
    last_event_seq_per_order: HashMap<ExchangeOrderId, EventSeq>,

    created_at: SystemTime,
    updated_at: SystemTime,

    entry_size_initial: Option<Decimal>,
    tp1_qty_target: Option<Decimal>,
    tp2_qty_target: Option<Decimal>,
}

impl ManagedPosition {
    pub fn new(
        position_id: PositionId,
        symbol: Symbol,
        side: Side,
        intent: PositionIntent,
        clock: &dyn Clock,
    ) -> Self {
        let now = clock.now_utc();
        Self {
            position_id,
            symbol,
            side,
            state: PositionState::Pending,
            current_stop_price: intent.initial_stop_price,
            intent,
            tp_filled_flags: [false; 3],
            break_even_triggered: false,
            trailing_active: false,
            fills: Vec::new(),
            processed_event_hashes: HashSet::new(),
            last_event_seq_per_order: HashMap::new(),
            created_at: now,
            updated_at: now,
            entry_size_initial: None,
            tp1_qty_target: None,
            tp2_qty_target: None,
        }
    }

    /// Builds a position for exchange exposure discovered with no matching
    /// local intent (reconciler phantom import). Starts directly in `Open`
    /// with the entry already recorded as filled, since by definition the
    /// fill already happened off our books. Bypasses `apply_event` — this is
    /// a reconciler-only construction path, not an exchange-event transition.
    pub fn from_phantom(
        position_id: PositionId,
        symbol: Symbol,
        side: Side,
        qty: Decimal,
        entry_price: Decimal,
        protective_stop_price: Decimal,
        clock: &dyn Clock,
    ) -> Self {
        let now = clock.now_utc();
        let intent = PositionIntent {
            initial_size: qty,
            initial_entry_price: entry_price,
            initial_stop_price: protective_stop_price,
            initial_tp_prices: [entry_price, entry_price, entry_price],
            entry_score: Decimal::ZERO,
            cluster: None,
            initial_stop_distance_pct: Decimal::ZERO,
            margin_used_at_entry: Decimal::ZERO,
            atr_at_entry: None,
        };
        let mut position = Self {
            position_id,
            symbol,
            side,
            state: PositionState::Open,
            current_stop_price: protective_stop_price,
            intent,
            tp_filled_flags: [true; 3],
            break_even_triggered: false,
            trailing_active: false,
            fills: Vec::new(),
            processed_event_hashes: HashSet::new(),
            last_event_seq_per_order: HashMap::new(),
            created_at: now,
            updated_at: now,
            entry_size_initial: Some(qty),
            tp1_qty_target: Some(Decimal::ZERO),
            tp2_qty_target: Some(Decimal::ZERO),
        };
        position.push_fill(
            &ExchangeOrderId("phantom-import".to_string()),
            crate::ids::FillId(format!("phantom-{}", position.position_id.as_str())),
            qty,
            entry_price,
            true,
            clock,
        );
        position
    }

    /// Meta-observation transition outside the normal event contract (I-F
    /// governs exchange-caused transitions; this is the reconciler recording
    /// that the exchange no longer shows a position the registry believes is
    /// open). Only valid from a non-terminal state.
    pub fn mark_orphaned(&mut self, clock: &dyn Clock) -> Result<(), PositionError> {
        if self.state.is_terminal() {
            return Err(PositionError::AlreadyTerminal);
        }
        self.state = PositionState::Orphaned;
        self.updated_at = clock.now_utc();
        Ok(())
    }

    /// Reconciler/gateway escalation path into the terminal `Error` state —
    /// used when the exit escalation ladder fails to flatten within `t3`, or
    /// when a naked position cannot be re-protected.
    pub fn mark_error(&mut self, clock: &dyn Clock) {
        self.state = PositionState::Error;
        self.updated_at = clock.now_utc();
    }

    pub fn position_id(&self) -> &PositionId {
        &self.position_id
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn current_state(&self) -> PositionState {
        self.state
    }

    pub fn current_stop_price(&self) -> Decimal {
        self.current_stop_price
    }

    pub fn break_even_triggered(&self) -> bool {
        self.break_even_triggered
    }

    pub fn trailing_active(&self) -> bool {
        self.trailing_active
    }

    pub fn intent(&self) -> &PositionIntent {
        &self.intent
    }

    pub fn fills(&self) -> &[FillRecord] {
        &self.fills
    }

    pub fn filled_entry_qty(&self) -> Decimal {
        self.fills
            .iter()
            .filter(|f| f.is_entry)
            .map(|f| f.qty)
            .sum()
    }

    pub fn filled_exit_qty(&self) -> Decimal {
        self.fills
            .iter()
            .filter(|f| !f.is_entry)
            .map(|f| f.qty)
            .sum()
    }

    pub fn remaining_qty(&self) -> Decimal {
        self.filled_entry_qty() - self.filled_exit_qty()
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, PositionError> {
        serde_json::to_vec(self)
            .map_err(|e| PositionError::Invariant(InvariantError::Other(e.to_string())))
    }

    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, PositionError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PositionError::Invariant(InvariantError::Other(e.to_string())))
    }

    fn already_processed(&self, event: &ExchangeEvent) -> bool {
        if self.processed_event_hashes.contains(&event.event_hash()) {
            return true;
        }
        if let Some(fill_id) = event.fill_id() {
            return self.fills.iter().any(|f| &f.fill_id == fill_id);
        }
        if let (Some(order_id), Some(seq)) = (event.order_id(), event.event_seq()) {
            if let Some(&last_seq) = self.last_event_seq_per_order.get(order_id) {
                return seq <= last_seq;
            }
        }
        false
    }

    fn record_processed(&mut self, event: &ExchangeEvent, clock: &dyn Clock) {
        self.processed_event_hashes.insert(event.event_hash());
        if let (Some(order_id), Some(seq)) = (event.order_id(), event.event_seq()) {
            self.last_event_seq_per_order.insert(order_id.clone(), seq);
        }
        self.updated_at = clock.now_utc();
    }

    fn push_fill(
        &mut self,
        order_id: &ExchangeOrderId,
        fill_id: crate::ids::FillId,
        qty: Decimal,
        price: Decimal,
        is_entry: bool,
        clock: &dyn Clock,
    ) {
        self.fills.push(FillRecord {
            fill_id,
            order_id: order_id.0.clone(),
            side: self.side,
            qty,
            price,
            timestamp: clock.now_utc(),
            is_entry,
        });
    }

    fn validate_stop_move(&self, new_price: Decimal, last_trade_price: Decimal) -> Result<(), PositionError> {
        let admissible = match self.side {
            Side::Long => new_price > self.current_stop_price && new_price <= last_trade_price,
            Side::Short => new_price < self.current_stop_price && new_price >= last_trade_price,
        };
        if admissible {
            Ok(())
        } else {
            Err(PositionError::InvalidStopMove(format!(
                "side={} current_stop={} requested={} last_trade={}",
                self.side, self.current_stop_price, new_price, last_trade_price
            )))
        }
    }

    fn finalise_entry(&mut self, config: &PositionConfig) -> Vec<Action> {
        let entry_size = self.filled_entry_qty();
        let tp1_target = entry_size * config.tp_splits[0];
        let tp2_target = entry_size * config.tp_splits[1];
        let tp3_target = entry_size - tp1_target - tp2_target;

        self.entry_size_initial = Some(entry_size);
        self.tp1_qty_target = Some(tp1_target);
        self.tp2_qty_target = Some(tp2_target);
        self.current_stop_price = self.intent.initial_stop_price;
        self.state = PositionState::Open;

        vec![
            Action::PlaceStop {
                price: self.intent.initial_stop_price,
            },
            Action::PlaceTpLadder {
                prices: self.intent.initial_tp_prices,
                qty_splits: [tp1_target, tp2_target, tp3_target],
            },
        ]
    }

    fn tp_target(&self, tp_index: u8) -> Decimal {
        let entry_size = self.entry_size_initial.unwrap_or(Decimal::ZERO);
        match tp_index {
            1 => self.tp1_qty_target.unwrap_or(Decimal::ZERO),
            2 => self.tp2_qty_target.unwrap_or(Decimal::ZERO),
            3 => entry_size - self.tp1_qty_target.unwrap_or(Decimal::ZERO) - self.tp2_qty_target.unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        }
    }

    /// The only mutator (spec §4.2). Idempotent: replays of an already-applied
    /// event (by `event_hash`, `fill_id`, or stale `event_seq`) are a no-op.
    pub fn apply_event(
        &mut self,
        event: ExchangeEvent,
        config: &PositionConfig,
        clock: &dyn Clock,
    ) -> Result<Vec<Action>, PositionError> {
        if self.already_processed(&event) {
            return Ok(Vec::new());
        }
        if self.state.is_terminal() {
            return Err(PositionError::AlreadyTerminal);
        }

        let actions = self.apply_event_inner(&event, config, clock)?;
        self.record_processed(&event, clock);
        Ok(actions)
    }

    fn apply_event_inner(
        &mut self,
        event: &ExchangeEvent,
        config: &PositionConfig,
        clock: &dyn Clock,
    ) -> Result<Vec<Action>, PositionError> {
        use ExchangeEvent::*;

        match event {
            EntryAck { .. } => Ok(Vec::new()),

            EntryFill {
                order_id,
                fill_id,
                qty,
                price,
                ..
            } => {
                if self.state != PositionState::Pending {
                    return Err(InvariantError::Other(
                        "ENTRY_FILL received outside PENDING state".to_string(),
                    )
                    .into());
                }
                self.push_fill(order_id, fill_id.clone(), *qty, *price, true, clock);
                if self.remaining_qty() < Decimal::ZERO {
                    return Err(InvariantError::QuantityNegative {
                        remaining_qty: self.remaining_qty().to_string(),
                    }
                    .into());
                }
                if self.filled_entry_qty() >= self.intent.initial_size {
                    Ok(self.finalise_entry(config))
                } else {
                    Ok(Vec::new())
                }
            }

            EntryCancelled { .. } | EntryRejected { .. } => {
                if self.state != PositionState::Pending {
                    return Err(InvariantError::Other(
                        "ENTRY_CANCELLED/ENTRY_REJECTED received outside PENDING state".to_string(),
                    )
                    .into());
                }
                if self.filled_entry_qty().is_zero() {
                    self.state = PositionState::Cancelled;
                    Ok(Vec::new())
                } else {
                    // Partial fill then the remainder was cancelled/rejected:
                    // finalise on what actually filled rather than leaving the
                    // position stuck with an entry order that will never
                    // complete.
                    Ok(self.finalise_entry(config))
                }
            }

            StopAck { .. } => Ok(Vec::new()),

            StopFill {
                order_id,
                fill_id,
                qty,
                price,
                ..
            } => {
                if !matches!(
                    self.state,
                    PositionState::Open | PositionState::Protected | PositionState::Partial
                ) {
                    return Err(InvariantError::Other(
                        "STOP_FILL received while position not protected".to_string(),
                    )
                    .into());
                }
                let executed = (*qty).min(self.remaining_qty().max(Decimal::ZERO));
                self.push_fill(order_id, fill_id.clone(), executed, *price, false, clock);
                if self.remaining_qty() < Decimal::ZERO {
                    return Err(InvariantError::QuantityNegative {
                        remaining_qty: self.remaining_qty().to_string(),
                    }
                    .into());
                }
                self.state = PositionState::Closed;
                Ok(Vec::new())
            }

            StopCancelled { .. } | StopRejected { .. } => Ok(Vec::new()),

            TpAck { .. } => Ok(Vec::new()),

            TpFill {
                tp_index,
                order_id,
                fill_id,
                qty,
                price,
                ..
            } => {
                if !matches!(
                    self.state,
                    PositionState::Open | PositionState::Protected | PositionState::Partial
                ) {
                    return Err(InvariantError::Other(
                        "TP_FILL received outside an active managed state".to_string(),
                    )
                    .into());
                }
                if !(1..=3).contains(tp_index) {
                    return Err(InvariantError::Other(format!("invalid tp_index {}", tp_index)).into());
                }

                let target = self.tp_target(*tp_index);
                let executed = (*qty).min(target).min(self.remaining_qty().max(Decimal::ZERO));
                self.push_fill(order_id, fill_id.clone(), executed, *price, false, clock);
                if self.remaining_qty() < Decimal::ZERO {
                    return Err(InvariantError::QuantityNegative {
                        remaining_qty: self.remaining_qty().to_string(),
                    }
                    .into());
                }
                self.tp_filled_flags[(*tp_index - 1) as usize] = true;

                let mut actions = Vec::new();

                if *tp_index == 1 {
                    let entry_size = self.entry_size_initial.unwrap_or(Decimal::ZERO);
                    let cumulative_partial = self.filled_exit_qty();
                    if !self.break_even_triggered
                        && !entry_size.is_zero()
                        && cumulative_partial >= config.min_partial_for_be * entry_size
                    {
                        let be_price = self.intent.initial_entry_price;
                        if self.validate_stop_move(be_price, *price).is_ok() {
                            self.current_stop_price = be_price;
                            self.break_even_triggered = true;
                            actions.push(Action::ReplaceStop { new_price: be_price });
                        }
                    }
                    if let (Some(atr_min), Some(atr)) =
                        (config.trailing_activation_atr_min, self.intent.atr_at_entry)
                    {
                        if atr >= atr_min {
                            self.trailing_active = true;
                        }
                    }
                }

                if self.remaining_qty().is_zero() {
                    self.state = PositionState::Closed;
                } else if self.state != PositionState::Partial {
                    self.state = PositionState::Partial;
                }

                Ok(actions)
            }

            ExitFill {
                order_id,
                fill_id,
                qty,
                price,
                ..
            } => {
                if self.state != PositionState::ExitPending {
                    return Err(InvariantError::Other(
                        "EXIT_FILL received outside EXIT_PENDING state".to_string(),
                    )
                    .into());
                }
                let executed = (*qty).min(self.remaining_qty().max(Decimal::ZERO));
                self.push_fill(order_id, fill_id.clone(), executed, *price, false, clock);
                if self.remaining_qty() < Decimal::ZERO {
                    return Err(InvariantError::QuantityNegative {
                        remaining_qty: self.remaining_qty().to_string(),
                    }
                    .into());
                }
                if self.remaining_qty().is_zero() {
                    self.state = PositionState::Closed;
                }
                Ok(Vec::new())
            }

            ExitRequested => {
                self.state = PositionState::ExitPending;
                Ok(vec![Action::FlattenNow])
            }
        }
    }
}
