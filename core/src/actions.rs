//! Follow-up actions emitted by `ManagedPosition::apply_event`.
//!
//! A Managed Position never calls back into the gateway (I-F): it returns a
//! list of actions, and the gateway is responsible for executing them.

use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    PlaceEntry,
    PlaceStop {
        price: Decimal,
    },
    ReplaceStop {
        new_price: Decimal,
    },
    PlaceTpLadder {
        prices: [Decimal; 3],
        qty_splits: [Decimal; 3],
    },
    CancelTp {
        tp_index: u8,
    },
    PartialClose {
        qty: Decimal,
    },
    FlattenNow,
    NoAction,
}
