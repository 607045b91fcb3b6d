//! Position Registry (spec §4.1): enforces I-A (uniqueness) and I-E
//! (no-reversal-without-flat); O(1) lookup by symbol; archived history.

use crate::error::RegistryError;
use crate::ids::PositionId;
use crate::position::ManagedPosition;
use crate::symbol::SymbolCanonicaliser;
use crate::types::{PositionState, Side, Symbol};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

pub type PositionHandle = Arc<AsyncMutex<ManagedPosition>>;

/// Map `symbol -> ManagedPosition`, plus a cached set of symbols currently
/// observed live on the exchange (kept fresh by the reconciler). The sole
/// writer to a symbol's active slot.
pub struct PositionRegistry {
    active: DashMap<Symbol, PositionHandle>,
    by_id: DashMap<PositionId, Symbol>,
    history: RwLock<Vec<ManagedPosition>>,
    known_exchange_symbols: RwLock<HashSet<Symbol>>,
    canonicaliser: Arc<dyn SymbolCanonicaliser>,
}

impl PositionRegistry {
    pub fn new(canonicaliser: Arc<dyn SymbolCanonicaliser>) -> Self {
        Self {
            active: DashMap::new(),
            by_id: DashMap::new(),
            history: RwLock::new(Vec::new()),
            known_exchange_symbols: RwLock::new(HashSet::new()),
            canonicaliser,
        }
    }

    pub fn canonicalise(&self, exchange_symbol: &str) -> Symbol {
        self.canonicaliser.canonicalise(exchange_symbol)
    }

    /// Installs `position` atomically. Fails with `DUPLICATE_POSITION` if a
    /// non-terminal position for the symbol already exists (I-A), or if the
    /// symbol has known live exchange exposure the registry didn't expect.
    pub fn register(&self, position: ManagedPosition) -> Result<PositionHandle, RegistryError> {
        let symbol = position.symbol().clone();
        let position_id = position.position_id().clone();

        if self.known_exchange_symbols.read().contains(&symbol) && !self.active.contains_key(&symbol) {
            return Err(RegistryError::KnownExchangeExposure {
                symbol: symbol.0.clone(),
            });
        }

        match self.active.entry(symbol.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // An occupied slot only ever holds non-terminal positions —
                // terminal ones are archived out immediately — so any hit here
                // is a live I-A breach, not a stale leftover.
                let _ = entry;
                Err(RegistryError::DuplicatePosition {
                    symbol: symbol.0.clone(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let handle: PositionHandle = Arc::new(AsyncMutex::new(position));
                entry.insert(handle.clone());
                self.by_id.insert(position_id, symbol);
                Ok(handle)
            }
        }
    }

    pub fn get(&self, exchange_symbol: &str) -> Option<PositionHandle> {
        let symbol = self.canonicalise(exchange_symbol);
        self.active.get(&symbol).map(|h| h.clone())
    }

    pub fn get_canonical(&self, symbol: &Symbol) -> Option<PositionHandle> {
        self.active.get(symbol).map(|h| h.clone())
    }

    /// Resolves an active position's handle by id. Client order ids embed the
    /// `position_id`, so this is how the gateway routes an exchange event back
    /// to the right handle without a separate client-order-id index.
    pub fn get_by_id(&self, position_id: &PositionId) -> Option<PositionHandle> {
        let symbol = self.by_id.get(position_id)?.clone();
        self.active.get(&symbol).map(|h| h.clone())
    }

    /// Asserts I-E: a reversal is only permitted once the current position
    /// for `symbol` has reached a terminal state. Does not itself create the
    /// new position — callers must still `register` it.
    pub fn request_reversal(&self, symbol: &Symbol, _opposite_side: Side) -> Result<(), RegistryError> {
        if self.active.contains_key(symbol) {
            return Err(RegistryError::ReversalBlocked {
                symbol: symbol.0.clone(),
            });
        }
        Ok(())
    }

    /// Moves a terminal position out of the active slot into history.
    pub fn archive(&self, symbol: &Symbol, position: ManagedPosition) -> Result<(), RegistryError> {
        if !position.current_state().is_terminal() {
            return Err(RegistryError::NotTerminal {
                symbol: symbol.0.clone(),
            });
        }
        self.active.remove(symbol);
        self.by_id.remove(position.position_id());
        self.history.write().push(position);
        Ok(())
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    pub fn find_in_history(&self, position_id: &PositionId) -> Option<ManagedPosition> {
        self.history
            .read()
            .iter()
            .find(|p| p.position_id() == position_id)
            .cloned()
    }

    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn set_known_exchange_symbols(&self, symbols: HashSet<Symbol>) {
        *self.known_exchange_symbols.write() = symbols;
    }

    pub fn known_exchange_symbols(&self) -> HashSet<Symbol> {
        self.known_exchange_symbols.read().clone()
    }

    /// Removes the active slot for `symbol` without archiving — used when the
    /// reconciler determines a position was a transient duplicate race.
    pub fn remove_without_archive(&self, symbol: &Symbol) {
        if let Some((_, handle)) = self.active.remove(symbol) {
            if let Ok(guard) = handle.try_lock() {
                self.by_id.remove(guard.position_id());
            }
        }
    }
}

#[allow(dead_code)]
fn assert_terminal_states_archivable(state: PositionState) -> bool {
    state.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::position::PositionIntent;
    use crate::symbol::DefaultCanonicaliser;
    use rust_decimal_macros::dec;

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

    fn registry() -> PositionRegistry {
        PositionRegistry::new(Arc::new(DefaultCanonicaliser))
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let clock = FakeClock::new();
        let reg = registry();
        let symbol = Symbol::from("BTC/USD");

        let p1 = ManagedPosition::new(
            PositionId::try_from("p1".to_string()).unwrap(),
            symbol.clone(),
            Side::Long,
            intent(),
            &clock,
        );
        reg.register(p1).unwrap();

        let p2 = ManagedPosition::new(
            PositionId::try_from("p2".to_string()).unwrap(),
            symbol,
            Side::Long,
            intent(),
            &clock,
        );
        let err = reg.register(p2).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePosition { .. }));
    }

    #[test]
    fn reversal_blocked_while_active() {
        let clock = FakeClock::new();
        let reg = registry();
        let symbol = Symbol::from("BTC/USD");

        let p1 = ManagedPosition::new(
            PositionId::try_from("p1".to_string()).unwrap(),
            symbol.clone(),
            Side::Long,
            intent(),
            &clock,
        );
        reg.register(p1).unwrap();

        let err = reg.request_reversal(&symbol, Side::Short).unwrap_err();
        assert!(matches!(err, RegistryError::ReversalBlocked { .. }));
    }

    #[test]
    fn archive_requires_terminal_state() {
        let clock = FakeClock::new();
        let reg = registry();
        let symbol = Symbol::from("BTC/USD");

        let p1 = ManagedPosition::new(
            PositionId::try_from("p1".to_string()).unwrap(),
            symbol.clone(),
            Side::Long,
            intent(),
            &clock,
        );
        let err = reg.archive(&symbol, p1).unwrap_err();
        assert!(matches!(err, RegistryError::NotTerminal { .. }));
    }
}
