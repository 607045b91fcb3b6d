//! Identifiers and the client order ID grammar.
//!
//! `position_id := letters/digits, <= 24 chars`
//! `client_order_id := "{position_id}:{kind}:{seq}"`

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_POSITION_ID_LEN: usize = 24;

/// Stable, process-generated identifier for a position. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionId(String);

impl PositionId {
    /// Generate a fresh id: timestamp-derived prefix plus a random suffix, kept
    /// within the client-order-id length budget.
    pub fn generate() -> Self {
        use rand::Rng;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let suffix: u32 = rand::thread_rng().gen();
        let id = format!("p{:x}{:x}", now, suffix);
        let id: String = id.chars().take(MAX_POSITION_ID_LEN).collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PositionId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, IdError> {
        if s.is_empty() || s.len() > MAX_POSITION_ID_LEN {
            return Err(IdError::InvalidPositionId(s));
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IdError::InvalidPositionId(s));
        }
        Ok(Self(s))
    }
}

/// The action a client order id was placed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Entry,
    Stop,
    Tp1,
    Tp2,
    Tp3,
    Exit,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Stop => "stop",
            Self::Tp1 => "tp1",
            Self::Tp2 => "tp2",
            Self::Tp3 => "tp3",
            Self::Exit => "exit",
        }
    }

    pub fn tp_index(self) -> Option<u8> {
        match self {
            Self::Tp1 => Some(1),
            Self::Tp2 => Some(2),
            Self::Tp3 => Some(3),
            _ => None,
        }
    }

    pub fn from_tp_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(Self::Tp1),
            2 => Some(Self::Tp2),
            3 => Some(Self::Tp3),
            _ => None,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(Self::Entry),
            "stop" => Some(Self::Stop),
            "tp1" => Some(Self::Tp1),
            "tp2" => Some(Self::Tp2),
            "tp3" => Some(Self::Tp3),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Deterministic, parseable client order id: `"{position_id}:{kind}:{seq}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    pub fn new(position_id: &PositionId, kind: OrderKind, seq: u64) -> Self {
        Self(format!("{}:{}:{}", position_id.as_str(), kind.as_str(), seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into `(position_id, kind, seq)`. Used by the gateway and
    /// reconciler to recover ownership of exchange-visible orders.
    pub fn parse(s: &str) -> Result<(PositionId, OrderKind, u64), IdError> {
        let mut parts = s.splitn(3, ':');
        let pid = parts.next().ok_or_else(|| IdError::Malformed(s.to_string()))?;
        let kind = parts.next().ok_or_else(|| IdError::Malformed(s.to_string()))?;
        let seq = parts.next().ok_or_else(|| IdError::Malformed(s.to_string()))?;
        if parts.next().is_some() {
            return Err(IdError::Malformed(s.to_string()));
        }
        let position_id = PositionId::try_from(pid.to_string())
            .map_err(|_| IdError::Malformed(s.to_string()))?;
        let kind = OrderKind::parse(kind).ok_or_else(|| IdError::Malformed(s.to_string()))?;
        let seq: u64 = seq.parse().map_err(|_| IdError::Malformed(s.to_string()))?;
        Ok((position_id, kind, seq))
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exchange-assigned order identifier (opaque string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeOrderId(pub String);

impl fmt::Display for ExchangeOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an exchange-reported fill.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FillId(pub String);

impl fmt::Display for FillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WAL intent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntentId(pub String);

impl IntentId {
    pub fn generate() -> Self {
        use rand::Rng;
        let v: u128 = rand::thread_rng().gen();
        Self(format!("i{:032x}", v))
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    InvalidPositionId(String),
    Malformed(String),
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPositionId(s) => write!(f, "invalid position id: {}", s),
            Self::Malformed(s) => write!(f, "malformed client order id: {}", s),
        }
    }
}

impl std::error::Error for IdError {}
