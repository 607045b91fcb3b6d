//! Exchange events consumed by a Managed Position.

use crate::ids::{ExchangeOrderId, FillId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Sequence number, monotonic per order, used for ordering and idempotency.
pub type EventSeq = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExchangeEvent {
    EntryAck {
        order_id: ExchangeOrderId,
        event_seq: EventSeq,
    },
    EntryFill {
        order_id: ExchangeOrderId,
        fill_id: FillId,
        qty: Decimal,
        price: Decimal,
        event_seq: EventSeq,
    },
    EntryCancelled {
        order_id: ExchangeOrderId,
        event_seq: EventSeq,
    },
    EntryRejected {
        order_id: ExchangeOrderId,
        reason: String,
        event_seq: EventSeq,
    },
    StopAck {
        order_id: ExchangeOrderId,
        event_seq: EventSeq,
    },
    StopFill {
        order_id: ExchangeOrderId,
        fill_id: FillId,
        qty: Decimal,
        price: Decimal,
        event_seq: EventSeq,
    },
    StopCancelled {
        order_id: ExchangeOrderId,
        event_seq: EventSeq,
    },
    StopRejected {
        order_id: ExchangeOrderId,
        reason: String,
        event_seq: EventSeq,
    },
    TpAck {
        tp_index: u8,
        order_id: ExchangeOrderId,
        event_seq: EventSeq,
    },
    TpFill {
        tp_index: u8,
        order_id: ExchangeOrderId,
        fill_id: FillId,
        qty: Decimal,
        price: Decimal,
        event_seq: EventSeq,
    },
    TpCancelled {
        tp_index: u8,
        order_id: ExchangeOrderId,
        event_seq: EventSeq,
    },
    ExitFill {
        order_id: ExchangeOrderId,
        fill_id: FillId,
        qty: Decimal,
        price: Decimal,
        event_seq: EventSeq,
    },
    /// Operator- or allocator-originated request to flatten the position now.
    ExitRequested,
}

impl ExchangeEvent {
    pub fn order_id(&self) -> Option<&ExchangeOrderId> {
        match self {
            Self::EntryAck { order_id, .. }
            | Self::EntryFill { order_id, .. }
            | Self::EntryCancelled { order_id, .. }
            | Self::EntryRejected { order_id, .. }
            | Self::StopAck { order_id, .. }
            | Self::StopFill { order_id, .. }
            | Self::StopCancelled { order_id, .. }
            | Self::StopRejected { order_id, .. }
            | Self::TpAck { order_id, .. }
            | Self::TpFill { order_id, .. }
            | Self::TpCancelled { order_id, .. }
            | Self::ExitFill { order_id, .. } => Some(order_id),
            Self::ExitRequested => None,
        }
    }

    pub fn event_seq(&self) -> Option<EventSeq> {
        match self {
            Self::EntryAck { event_seq, .. }
            | Self::EntryFill { event_seq, .. }
            | Self::EntryCancelled { event_seq, .. }
            | Self::EntryRejected { event_seq, .. }
            | Self::StopAck { event_seq, .. }
            | Self::StopFill { event_seq, .. }
            | Self::StopCancelled { event_seq, .. }
            | Self::StopRejected { event_seq, .. }
            | Self::TpAck { event_seq, .. }
            | Self::TpFill { event_seq, .. }
            | Self::TpCancelled { event_seq, .. }
            | Self::ExitFill { event_seq, .. } => Some(*event_seq),
            Self::ExitRequested => None,
        }
    }

    pub fn fill_id(&self) -> Option<&FillId> {
        match self {
            Self::EntryFill { fill_id, .. }
            | Self::StopFill { fill_id, .. }
            | Self::TpFill { fill_id, .. }
            | Self::ExitFill { fill_id, .. } => Some(fill_id),
            _ => None,
        }
    }

    /// Deterministic hash used for idempotency (I-G): derived from
    /// `order_id + event_seq + fill_id` when present.
    pub fn event_hash(&self) -> String {
        match (self.order_id(), self.event_seq(), self.fill_id()) {
            (Some(oid), Some(seq), Some(fid)) => format!("{}/{}/{}", oid, seq, fid),
            (Some(oid), Some(seq), None) => format!("{}/{}", oid, seq),
            _ => "exit-requested".to_string(),
        }
    }
}
