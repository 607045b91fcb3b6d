//! Value types shared across the position/execution subsystem.
//!
//! Prices and quantities carry `rust_decimal::Decimal`, a fixed-precision
//! decimal type; conversion to the exchange's integer tick grid happens at a
//! single boundary, [`crate::instrument::InstrumentSpecProvider`].

use crate::ids::FillId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Tagged variant for the lifecycle of a single position.
///
/// Terminal: [`PositionState::Closed`], [`PositionState::Cancelled`],
/// [`PositionState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Pending,
    Open,
    /// Matched as a non-terminal "managed" state alongside `Open`/`Partial`
    /// throughout the state machine, but never assigned by the current TP1
    /// break-even handler, which moves straight to `Partial` (DESIGN Open
    /// Question #2). Reserved for a future trailing-stop transition that
    /// distinguishes "stop at break-even, no TP filled yet" from `Open`.
    Protected,
    Partial,
    ExitPending,
    Closed,
    Cancelled,
    Error,
    Orphaned,
}

impl PositionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled | Self::Error)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Open => "OPEN",
            Self::Protected => "PROTECTED",
            Self::Partial => "PARTIAL",
            Self::ExitPending => "EXIT_PENDING",
            Self::Closed => "CLOSED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
            Self::Orphaned => "ORPHANED",
        };
        write!(f, "{}", s)
    }
}

/// A single exchange-reported fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub fill_id: FillId,
    pub order_id: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub timestamp: SystemTime,
    pub is_entry: bool,
}

/// Canonical tradable symbol, already run through a `SymbolCanonicaliser`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}
