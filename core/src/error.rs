//! Error taxonomy (spec §7): operational (retry), data (skip), business
//! (reject), invariant (halt), integrity (error state). Component errors are
//! plain enums with hand-written `Display`; they convert into `CoreError` at
//! the gateway boundary. `anyhow` is reserved for the outermost layer (CLI,
//! tick loop) and never appears in component signatures.

use std::fmt;

/// Breach of one of the position invariants I-A..I-K, or a registry-level
/// consistency rule. Always fatal to the affected position/symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    QuantityNegative { remaining_qty: String },
    ImmutableFieldChanged { field: &'static str },
    StopNotMonotonic { current: String, requested: String },
    ClientIdCollision { client_order_id: String },
    NormalisationConflict { canonical: String, a: String, b: String },
    Other(String),
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuantityNegative { remaining_qty } => {
                write!(f, "I-B breach: remaining_qty would go negative ({})", remaining_qty)
            }
            Self::ImmutableFieldChanged { field } => {
                write!(f, "I-C breach: immutable field '{}' changed after entry ack", field)
            }
            Self::StopNotMonotonic { current, requested } => write!(
                f,
                "I-D breach: stop move from {} to {} is not toward profit",
                current, requested
            ),
            Self::ClientIdCollision { client_order_id } => {
                write!(f, "CLIENT_ID_COLLISION: {}", client_order_id)
            }
            Self::NormalisationConflict { canonical, a, b } => write!(
                f,
                "NORMALISATION_CONFLICT: '{}' and '{}' both canonicalise to '{}'",
                a, b, canonical
            ),
            Self::Other(msg) => write!(f, "invariant breach: {}", msg),
        }
    }
}

impl std::error::Error for InvariantError {}

/// Errors raised while applying an event to a Managed Position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    /// The position is already terminal; no further events are accepted.
    AlreadyTerminal,
    /// The requested stop replacement fails the monotonicity/market-cross rule.
    InvalidStopMove(String),
    Invariant(InvariantError),
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyTerminal => write!(f, "position is in a terminal state"),
            Self::InvalidStopMove(reason) => write!(f, "stop move rejected: {}", reason),
            Self::Invariant(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PositionError {}

impl From<InvariantError> for PositionError {
    fn from(e: InvariantError) -> Self {
        Self::Invariant(e)
    }
}

/// Errors raised by the Position Registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// I-A breach: a non-terminal position already occupies this symbol.
    DuplicatePosition { symbol: String },
    /// I-E breach: reversal requested before the prior position is terminal.
    ReversalBlocked { symbol: String },
    /// Defence-in-depth: symbol has live exchange exposure the registry didn't expect.
    KnownExchangeExposure { symbol: String },
    NormalisationConflict(InvariantError),
    /// Archival was requested for a position that is not terminal.
    NotTerminal { symbol: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicatePosition { symbol } => write!(f, "DUPLICATE_POSITION: {}", symbol),
            Self::ReversalBlocked { symbol } => write!(f, "REVERSAL_BLOCKED: {}", symbol),
            Self::KnownExchangeExposure { symbol } => {
                write!(f, "symbol {} has known live exchange exposure", symbol)
            }
            Self::NormalisationConflict(e) => write!(f, "{}", e),
            Self::NotTerminal { symbol } => {
                write!(f, "cannot archive non-terminal position for {}", symbol)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Errors raised by the Position Persistence layer.
#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Corrupt(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "persistence I/O error: {}", e),
            Self::Serialization(e) => write!(f, "persistence serialization error: {}", e),
            Self::Corrupt(msg) => write!(f, "persisted state is corrupt: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

/// Top-level error taxonomy surfaced by the Execution Gateway (spec §7).
#[derive(Debug)]
pub enum CoreError {
    /// Operational (retry): handled locally by the gateway's backoff loop;
    /// surfaced only once retries are exhausted.
    ExchangeUnavailable(String),
    RateLimited,
    Timeout,
    /// Data (skip): the specific intent is refused; other symbols unaffected.
    UnknownSymbol(String),
    InstrumentSpecMissing(String),
    /// Business (reject): no state mutation.
    RejectedByRisk(String),
    Registry(RegistryError),
    ExchangeRejected(String),
    /// Invariant (halt): fires the kill switch.
    Invariant(InvariantError),
    /// Integrity (error state): operator action required.
    Integrity(String),
    /// System is halted or degraded; new intents refused.
    SystemHalted,
    Degraded,
    Persistence(PersistenceError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExchangeUnavailable(r) => write!(f, "EXCHANGE_UNAVAILABLE: {}", r),
            Self::RateLimited => write!(f, "RATE_LIMITED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::UnknownSymbol(s) => write!(f, "UNKNOWN_SYMBOL: {}", s),
            Self::InstrumentSpecMissing(s) => write!(f, "INSTRUMENT_SPEC_MISSING: {}", s),
            Self::RejectedByRisk(r) => write!(f, "REJECTED_BY_RISK: {}", r),
            Self::Registry(e) => write!(f, "{}", e),
            Self::ExchangeRejected(r) => write!(f, "EXCHANGE_REJECTED: {}", r),
            Self::Invariant(e) => write!(f, "INVARIANT_BREACH: {}", e),
            Self::Integrity(r) => write!(f, "integrity error: {}", r),
            Self::SystemHalted => write!(f, "SYSTEM_HALTED"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Persistence(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<RegistryError> for CoreError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<InvariantError> for CoreError {
    fn from(e: InvariantError) -> Self {
        Self::Invariant(e)
    }
}

impl From<PositionError> for CoreError {
    fn from(e: PositionError) -> Self {
        match e {
            PositionError::Invariant(inv) => Self::Invariant(inv),
            other => Self::Integrity(other.to_string()),
        }
    }
}

impl From<PersistenceError> for CoreError {
    fn from(e: PersistenceError) -> Self {
        Self::Persistence(e)
    }
}
