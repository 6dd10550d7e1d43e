use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::OrderSide;

/// An executed trade. Append-only: created by the matching engine, immutable
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub id: i64,
    pub trading_pair_id: i64,
    pub symbol: String,
    pub buy_order_id: i64,
    pub sell_order_id: i64,
    pub buyer_user_id: i64,
    pub seller_user_id: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    /// Millisecond unix timestamp assigned by the engine.
    pub executed_at: i64,
}

/// Public market trade view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeView {
    #[serde(with = "super::id_str")]
    pub trade_id: i64,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_at: i64,
}

impl From<&Trade> for TradeView {
    fn from(trade: &Trade) -> Self {
        Self {
            trade_id: trade.id,
            symbol: trade.symbol.clone(),
            price: trade.price,
            quantity: trade.quantity,
            executed_at: trade.executed_at,
        }
    }
}

/// Per-user trade view, carrying which side the user was on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTradeView {
    #[serde(with = "super::id_str")]
    pub trade_id: i64,
    #[serde(with = "super::id_str")]
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    pub executed_at: i64,
}

impl UserTradeView {
    /// Build the view for one side of a trade. `user_id` must be the buyer or
    /// the seller of `trade`.
    pub fn for_user(trade: &Trade, user_id: i64) -> Self {
        let (side, order_id) = if user_id == trade.buyer_user_id {
            (OrderSide::Buy, trade.buy_order_id)
        } else {
            (OrderSide::Sell, trade.sell_order_id)
        };
        Self {
            trade_id: trade.id,
            order_id,
            symbol: trade.symbol.clone(),
            side,
            price: trade.price,
            quantity: trade.quantity,
            fee: trade.fee,
            fee_asset: trade.fee_asset.clone(),
            executed_at: trade.executed_at,
        }
    }
}
