//! `ExchangeClient` (spec §6.1): the single external collaborator the
//! gateway speaks to. A `FakeExchangeClient` ships for tests; production
//! deployments inject their own venue-specific implementation.

use crate::ids::{ClientOrderId, ExchangeOrderId, FillId};
use crate::types::Side;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOrderResult {
    pub order_id: ExchangeOrderId,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOrder {
    pub order_id: ExchangeOrderId,
    pub client_order_id: ClientOrderId,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub reduce_only: bool,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub liquidation_price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub margin_available: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEventKind {
    Ack,
    Fill,
    Cancel,
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderEvent {
    pub order_id: ExchangeOrderId,
    pub client_order_id: ClientOrderId,
    pub event_seq: u64,
    pub kind: OrderEventKind,
    pub fill_id: Option<FillId>,
    pub qty: Option<Decimal>,
    pub price: Option<Decimal>,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    Rejected(String),
    Unavailable(String),
    Timeout,
    RateLimited,
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(r) => write!(f, "exchange rejected order: {}", r),
            Self::Unavailable(r) => write!(f, "exchange unavailable: {}", r),
            Self::Timeout => write!(f, "exchange call timed out"),
            Self::RateLimited => write!(f, "exchange rate limited"),
        }
    }
}

impl std::error::Error for ExchangeError {}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        qty: Decimal,
        price: Option<Decimal>,
        reduce_only: bool,
        client_order_id: &ClientOrderId,
    ) -> Result<SubmitOrderResult, ExchangeError>;

    async fn cancel_order(&self, order_id: &ExchangeOrderId) -> Result<(), ExchangeError>;

    async fn fetch_open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn fetch_account(&self) -> Result<AccountSnapshot, ExchangeError>;
}

/// Deterministic, fully in-memory exchange used by tests. Orders submitted
/// are immediately acked; fills and rejects are injected by the test via
/// `inject_*` helpers, matching the reference codebase's practice of
/// providing fakes for every consumed interface rather than mocking
/// individual calls.
pub struct FakeExchangeClient {
    state: Mutex<FakeExchangeState>,
}

#[derive(Default)]
struct FakeExchangeState {
    orders: HashMap<ExchangeOrderId, ExchangeOrder>,
    next_order_seq: u64,
    positions: Vec<ExchangePosition>,
    account: AccountSnapshot,
    reject_next: bool,
    unavailable_next: bool,
}

impl Default for AccountSnapshot {
    fn default() -> Self {
        Self {
            equity: Decimal::new(100_000, 0),
            margin_used: Decimal::ZERO,
            margin_available: Decimal::new(100_000, 0),
        }
    }
}

impl FakeExchangeClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeExchangeState {
                account: AccountSnapshot::default(),
                ..Default::default()
            }),
        }
    }

    pub fn set_account(&self, account: AccountSnapshot) {
        self.state.lock().account = account;
    }

    pub fn set_positions(&self, positions: Vec<ExchangePosition>) {
        self.state.lock().positions = positions;
    }

    pub fn reject_next_submit(&self) {
        self.state.lock().reject_next = true;
    }

    pub fn fail_next_submit_unavailable(&self) {
        self.state.lock().unavailable_next = true;
    }

    pub fn order(&self, order_id: &ExchangeOrderId) -> Option<ExchangeOrder> {
        self.state.lock().orders.get(order_id).cloned()
    }

    pub fn remove_order(&self, order_id: &ExchangeOrderId) {
        self.state.lock().orders.remove(order_id);
    }
}

impl Default for FakeExchangeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for FakeExchangeClient {
    async fn submit_order(
        &self,
        _symbol: &str,
        side: Side,
        _order_type: OrderType,
        qty: Decimal,
        price: Option<Decimal>,
        reduce_only: bool,
        client_order_id: &ClientOrderId,
    ) -> Result<SubmitOrderResult, ExchangeError> {
        let mut state = self.state.lock();
        if state.unavailable_next {
            state.unavailable_next = false;
            return Err(ExchangeError::Unavailable("simulated outage".to_string()));
        }
        if state.reject_next {
            state.reject_next = false;
            return Err(ExchangeError::Rejected("simulated rejection".to_string()));
        }

        state.next_order_seq += 1;
        let order_id = ExchangeOrderId(format!("x{}", state.next_order_seq));
        let order = ExchangeOrder {
            order_id: order_id.clone(),
            client_order_id: client_order_id.clone(),
            side,
            price: price.unwrap_or(Decimal::ZERO),
            qty,
            reduce_only,
            status: OrderStatus::Open,
        };
        state.orders.insert(order_id.clone(), order);
        Ok(SubmitOrderResult {
            order_id,
            status: OrderStatus::Open,
        })
    }

    async fn cancel_order(&self, order_id: &ExchangeOrderId) -> Result<(), ExchangeError> {
        let mut state = self.state.lock();
        match state.orders.get_mut(order_id) {
            Some(order) => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn fetch_open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .orders
            .values()
            .filter(|o| matches!(o.status, OrderStatus::Open | OrderStatus::PartiallyFilled))
            .cloned()
            .collect())
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        Ok(self.state.lock().positions.clone())
    }

    async fn fetch_account(&self) -> Result<AccountSnapshot, ExchangeError> {
        Ok(self.state.lock().account)
    }
}
