//! `InstrumentSpecProvider` (spec §6.1): the single boundary where prices and
//! quantities are quantised to the exchange's integer tick grid.
//! `ROUND_DOWN` for quantity, nearest for price.

use crate::types::Symbol;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentSpec {
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub contract_size: Decimal,
}

pub trait InstrumentSpecProvider: Send + Sync {
    fn get(&self, symbol: &Symbol) -> Option<InstrumentSpec>;
}

impl InstrumentSpec {
    /// Quantise a quantity down to the nearest `qty_step`, never exceeding
    /// the requested amount.
    pub fn quantise_qty(&self, qty: Decimal) -> Decimal {
        if self.qty_step.is_zero() {
            return qty;
        }
        (qty / self.qty_step).floor() * self.qty_step
    }

    /// Quantise a price to the nearest `tick_size`.
    pub fn quantise_price(&self, price: Decimal) -> Decimal {
        if self.tick_size.is_zero() {
            return price;
        }
        let ticks = (price / self.tick_size)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        ticks * self.tick_size
    }

    pub fn is_tick_aligned(&self, price: Decimal) -> bool {
        if self.tick_size.is_zero() {
            return true;
        }
        (price / self.tick_size).fract().is_zero()
    }

    pub fn meets_min_qty(&self, qty: Decimal) -> bool {
        qty >= self.min_qty
    }

    /// For logging/config: tick size expressed in decimal places, used by
    /// display-only code paths. Returns `None` if `tick_size` has no finite
    /// integer representation of decimal places (should not happen for
    /// venue-provided tick sizes).
    pub fn tick_decimals(&self) -> Option<u32> {
        self.tick_size.to_f64().map(|_| self.tick_size.scale())
    }
}

/// In-memory, config-driven instrument table. Production deployments would
/// likely refresh this from the exchange's instrument-info endpoint; here it
/// is a simple map since fetching instrument metadata is itself an external
/// collaborator concern.
#[derive(Debug, Clone, Default)]
pub struct StaticInstrumentTable {
    specs: HashMap<Symbol, InstrumentSpec>,
}

impl StaticInstrumentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spec(mut self, symbol: Symbol, spec: InstrumentSpec) -> Self {
        self.specs.insert(symbol, spec);
        self
    }
}

impl InstrumentSpecProvider for StaticInstrumentTable {
    fn get(&self, symbol: &Symbol) -> Option<InstrumentSpec> {
        self.specs.get(symbol).copied()
    }
}
