use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A trading pair (market), administratively created.
///
/// `symbol` is immutable once created. Deactivating a pair stops new order
/// submission but does not cancel resting orders.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradingPair {
    pub id: i64,
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub price_precision: i32,
    pub qty_precision: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl TradingPair {
    /// Whether `value` fits within `scale` fractional digits.
    fn fits_scale(value: Decimal, scale: i32) -> bool {
        value.normalize().scale() as i32 <= scale
    }

    pub fn quantity_in_bounds(&self, qty: Decimal) -> bool {
        qty >= self.min_qty && qty <= self.max_qty
    }

    pub fn quantity_precision_ok(&self, qty: Decimal) -> bool {
        Self::fits_scale(qty, self.qty_precision)
    }

    pub fn price_precision_ok(&self, price: Decimal) -> bool {
        Self::fits_scale(price, self.price_precision)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTradingPairRequest {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub price_precision: i32,
    pub qty_precision: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradingPairView {
    #[serde(with = "super::id_str")]
    pub id: i64,
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub price_precision: i32,
    pub qty_precision: i32,
    pub is_active: bool,
}

impl From<TradingPair> for TradingPairView {
    fn from(pair: TradingPair) -> Self {
        Self {
            id: pair.id,
            symbol: pair.symbol,
            base_asset: pair.base_asset,
            quote_asset: pair.quote_asset,
            min_qty: pair.min_qty,
            max_qty: pair.max_qty,
            price_precision: pair.price_precision,
            qty_precision: pair.qty_precision,
            is_active: pair.is_active,
        }
    }
}
