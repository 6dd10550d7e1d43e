//! Event Publisher
//!
//! Fan-out of market and per-user events to subscribed sessions. One
//! broadcast channel per event family preserves per-topic ordering; capacity
//! comes from `event_queue_depth`. Delivery is at-least-once: slow
//! subscribers observe `RecvError::Lagged` and are expected to resynchronize
//! from a snapshot.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{AssetView, OrderSide, OrderView, Trade, UserTradeView};

/// Ticker update for `price:<symbol>`.
#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub last_price: Decimal,
    pub last_quantity: Decimal,
    pub change_24h: Decimal,
    pub change_percent_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h: Decimal,
    /// (best bid + best ask) / 2, present when both sides exist.
    pub mid_price: Option<Decimal>,
    pub timestamp: i64,
}

/// One changed price level: `quantity` is the new aggregate at `price`,
/// zero when the level vanished.
#[derive(Debug, Clone, Serialize)]
pub struct LevelChange {
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Delta for `orderbook:<symbol>`: exactly the levels whose aggregate
/// quantity changed, not a full snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookDelta {
    pub symbol: String,
    pub changes: Vec<LevelChange>,
    pub timestamp: i64,
}

/// Public trade event for `trades:<symbol>`.
#[derive(Debug, Clone)]
pub struct TradeExecuted {
    pub trade: Trade,
    /// Aggressor side: the side of the taker order that produced this trade.
    pub taker_side: OrderSide,
}

/// Full order view for `userOrders:<userId>`.
#[derive(Debug, Clone)]
pub struct UserOrderUpdate {
    pub user_id: i64,
    pub order: OrderView,
}

/// Per-user trade view for `userTrades:<userId>`.
#[derive(Debug, Clone)]
pub struct UserTradeUpdate {
    pub user_id: i64,
    pub trade: UserTradeView,
}

/// Changed asset records for `userAssets:<userId>`.
#[derive(Debug, Clone)]
pub struct UserAssetUpdate {
    pub user_id: i64,
    pub assets: Vec<AssetView>,
}

/// Operator-facing alert, emitted when a symbol is halted on an invariant
/// breach.
#[derive(Debug, Clone, Serialize)]
pub struct EngineAlert {
    pub symbol: String,
    pub message: String,
    pub timestamp: i64,
}

pub struct EventPublisher {
    price_tx: broadcast::Sender<PriceUpdate>,
    book_tx: broadcast::Sender<OrderBookDelta>,
    trade_tx: broadcast::Sender<TradeExecuted>,
    user_order_tx: broadcast::Sender<UserOrderUpdate>,
    user_trade_tx: broadcast::Sender<UserTradeUpdate>,
    user_asset_tx: broadcast::Sender<UserAssetUpdate>,
    alert_tx: broadcast::Sender<EngineAlert>,
}

impl EventPublisher {
    pub fn new(queue_depth: usize) -> Self {
        let (price_tx, _) = broadcast::channel(queue_depth);
        let (book_tx, _) = broadcast::channel(queue_depth);
        let (trade_tx, _) = broadcast::channel(queue_depth);
        let (user_order_tx, _) = broadcast::channel(queue_depth);
        let (user_trade_tx, _) = broadcast::channel(queue_depth);
        let (user_asset_tx, _) = broadcast::channel(queue_depth);
        let (alert_tx, _) = broadcast::channel(16);
        Self {
            price_tx,
            book_tx,
            trade_tx,
            user_order_tx,
            user_trade_tx,
            user_asset_tx,
            alert_tx,
        }
    }

    // Publishing never fails: a send error just means no live subscribers.

    pub fn publish_price(&self, update: PriceUpdate) {
        let _ = self.price_tx.send(update);
    }

    pub fn publish_book_delta(&self, delta: OrderBookDelta) {
        let _ = self.book_tx.send(delta);
    }

    pub fn publish_trade(&self, event: TradeExecuted) {
        let _ = self.trade_tx.send(event);
    }

    pub fn publish_user_order(&self, update: UserOrderUpdate) {
        let _ = self.user_order_tx.send(update);
    }

    pub fn publish_user_trade(&self, update: UserTradeUpdate) {
        let _ = self.user_trade_tx.send(update);
    }

    pub fn publish_user_assets(&self, update: UserAssetUpdate) {
        let _ = self.user_asset_tx.send(update);
    }

    pub fn publish_alert(&self, alert: EngineAlert) {
        let _ = self.alert_tx.send(alert);
    }

    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate> {
        self.price_tx.subscribe()
    }

    pub fn subscribe_book_deltas(&self) -> broadcast::Receiver<OrderBookDelta> {
        self.book_tx.subscribe()
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<TradeExecuted> {
        self.trade_tx.subscribe()
    }

    pub fn subscribe_user_orders(&self) -> broadcast::Receiver<UserOrderUpdate> {
        self.user_order_tx.subscribe()
    }

    pub fn subscribe_user_trades(&self) -> broadcast::Receiver<UserTradeUpdate> {
        self.user_trade_tx.subscribe()
    }

    pub fn subscribe_user_assets(&self) -> broadcast::Receiver<UserAssetUpdate> {
        self.user_asset_tx.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<EngineAlert> {
        self.alert_tx.subscribe()
    }
}
