//! Position lifecycle and execution core for a perpetual-futures trading
//! system.
//!
//! ## Modules
//! - [`types`], [`ids`], [`events`], [`actions`]: shared vocabulary.
//! - [`clock`], [`alert`], [`symbol`], [`instrument`]: small ambient seams.
//! - [`position`]: the Managed Position state machine (§4.2).
//! - [`registry`]: the Position Registry (§4.1).
//! - [`risk`]: pre-trade risk gate (§4.4 portfolio invariants, cooldowns).
//! - [`exchange`]: the `ExchangeClient` boundary and its test double.
//! - [`gateway`]: the Execution Gateway (§4.4) — the sole writer to the
//!   exchange.
//! - [`reconciler`]: the Reconciler & Safety Monitor (§4.5), including the
//!   kill switch.
//! - [`persistence`]: WAL, snapshots, history, halt state (§4.3, §6.3).
//! - [`resilience`]: backoff and circuit breaker for a degraded exchange.
//! - [`config`]: runtime configuration (§9 ambient layer).
//! - [`error`]: the error taxonomy (§7).
//! - [`engine`]: composition root — startup recovery and the tick loop (§4.3, §5).

pub mod actions;
pub mod alert;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod gateway;
pub mod ids;
pub mod instrument;
pub mod persistence;
pub mod position;
pub mod reconciler;
pub mod registry;
pub mod resilience;
pub mod risk;
pub mod symbol;
pub mod types;

pub use engine::Engine;
pub use error::CoreError;
pub use gateway::ExecutionGateway;
pub use reconciler::Reconciler;
pub use registry::PositionRegistry;

/// Convenient imports for a binary wiring up the whole system.
pub mod prelude {
    pub use crate::actions::Action;
    pub use crate::alert::{AlertSeverity, AlertSink, ConsoleAlertSink, NullAlertSink};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::Config;
    pub use crate::engine::{Engine, RecoveryReport, StatusReport, SystemState};
    pub use crate::error::CoreError;
    pub use crate::events::ExchangeEvent;
    pub use crate::exchange::{ExchangeClient, FakeExchangeClient};
    pub use crate::gateway::ExecutionGateway;
    pub use crate::ids::{ClientOrderId, ExchangeOrderId, OrderKind, PositionId};
    pub use crate::instrument::{InstrumentSpec, InstrumentSpecProvider, StaticInstrumentTable};
    pub use crate::persistence::{HaltStore, PositionStore, Wal};
    pub use crate::position::{ManagedPosition, PositionConfig, PositionIntent};
    pub use crate::reconciler::Reconciler;
    pub use crate::registry::PositionRegistry;
    pub use crate::risk::{RiskEngine, SimpleRiskEngine, TradeIntent};
    pub use crate::symbol::{DefaultCanonicaliser, SymbolCanonicaliser};
    pub use crate::types::{PositionState, Side, Symbol};
}
