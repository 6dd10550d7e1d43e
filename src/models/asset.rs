use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Durable balance row, keyed `(user_id, symbol)`.
///
/// `total = available + frozen` is derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Asset {
    pub user_id: i64,
    pub symbol: String,
    pub available: Decimal,
    pub frozen: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot view handed to queries and the event publisher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetView {
    #[serde(with = "super::id_str")]
    pub user_id: i64,
    pub symbol: String,
    pub available: Decimal,
    pub frozen: Decimal,
    pub total: Decimal,
}

impl AssetView {
    pub fn new(user_id: i64, symbol: String, available: Decimal, frozen: Decimal) -> Self {
        Self {
            user_id,
            symbol,
            available,
            frozen,
            total: available + frozen,
        }
    }
}
