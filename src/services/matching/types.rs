//! Matching Engine Types
//!
//! Shared types for the order book and engine, plus the engine-level error
//! taxonomy surfaced to callers.

use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use thiserror::Error;

use crate::models::{OrderSide, Trade};

// ============================================================================
// Price Key
// ============================================================================

/// Price level key with 8 fixed fractional digits for exact ordering and
/// hashing. Decimal prices are validated against pair precision before they
/// reach the book, so the scaling here is lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceKey(i64);

const PRICE_SCALE: i64 = 100_000_000;

impl PriceKey {
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = (price * Decimal::from(PRICE_SCALE)).trunc();
        let value = scaled.mantissa() / 10i128.pow(scaled.scale());
        PriceKey(value as i64)
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(PRICE_SCALE)
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Book Entry
// ============================================================================

/// A resting order as the book sees it. The full record lives in the order
/// store; the book carries only what matching needs.
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub order_id: i64,
    pub user_id: i64,
    pub price: Decimal,
    pub remaining: Decimal,
    /// Engine-assigned insertion timestamp (ms); drives time priority.
    pub inserted_at: i64,
}

// ============================================================================
// Match Outcomes
// ============================================================================

/// Result of a submit call: the taker's final state plus everything the
/// match produced.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub order: crate::models::Order,
    pub trades: Vec<Trade>,
}

/// Result of a cancel-all sweep.
#[derive(Debug, Clone, Serialize)]
pub struct CancelAllOutcome {
    pub success_count: usize,
    pub failed_count: usize,
    #[serde(serialize_with = "ids_as_strings")]
    pub cancelled_ids: Vec<i64>,
}

fn ids_as_strings<S>(ids: &[i64], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(ids.iter().map(|id| id.to_string()))
}

/// Aggregated top-N view of one book side: `(price, total quantity)`.
pub type DepthLevels = Vec<(Decimal, Decimal)>;

/// Top-N book snapshot for broadcast and queries.
#[derive(Debug, Clone, Serialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub bids: DepthLevels,
    pub asks: DepthLevels,
    pub timestamp: i64,
}

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Engine-level errors surfaced to submitters.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Bad input: no state change, surfaced to the caller.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown or inactive symbol: {0}")]
    UnknownSymbol(String),

    #[error("insufficient funds: need {needed} {symbol}, available {available}")]
    InsufficientFunds {
        symbol: String,
        needed: Decimal,
        available: Decimal,
    },

    #[error("order {0} not found")]
    NotFound(i64),

    #[error("order {order_id} does not belong to user {user_id}")]
    NotOwner { order_id: i64, user_id: i64 },

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// An invariant believed unreachable was violated; the affected symbol
    /// is halted and requires operator intervention.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    /// External cancellation observed before the serialisation point.
    #[error("operation cancelled")]
    Cancelled,
}

impl ExchangeError {
    /// Stable machine-readable code for this error kind, surfaced across
    /// the trust boundary alongside the human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::Validation(_) | ExchangeError::UnknownSymbol(_) => "VALIDATION_FAILED",
            ExchangeError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            ExchangeError::NotFound(_) => "ORDER_NOT_FOUND",
            ExchangeError::NotOwner { .. } => "NOT_ORDER_OWNER",
            ExchangeError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            ExchangeError::InconsistentState(_) => "SYMBOL_HALTED",
            ExchangeError::Cancelled => "CANCELLED",
        }
    }
}

/// Convenience used by the book-delta builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LevelRef {
    pub side: OrderSide,
    pub key: PriceKey,
}
