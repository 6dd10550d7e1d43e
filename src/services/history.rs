//! Trade History
//!
//! Bounded in-memory history of recent trades, recorded by the engine at
//! execution time. Runtime queries (order trades, user trades, market
//! trades) read from here, never from the durable store; the store keeps
//! the full archive for offline use.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::models::Trade;

pub struct TradeHistory {
    by_symbol: DashMap<String, Mutex<VecDeque<Trade>>>,
    /// Retained trades per symbol; older entries fall off the front.
    capacity: usize,
}

impl TradeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_symbol: DashMap::new(),
            capacity,
        }
    }

    pub fn record(&self, trade: Trade) {
        let entry = self
            .by_symbol
            .entry(trade.symbol.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut trades = entry.lock();
        if trades.len() == self.capacity {
            trades.pop_front();
        }
        trades.push_back(trade);
    }

    /// Most recent trades for a symbol, newest first.
    pub fn recent(&self, symbol: &str, limit: usize) -> Vec<Trade> {
        match self.by_symbol.get(symbol) {
            Some(entry) => entry.lock().iter().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// All retained trades an order participated in, oldest first.
    pub fn by_order(&self, order_id: i64) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .by_symbol
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .lock()
                    .iter()
                    .filter(|t| t.buy_order_id == order_id || t.sell_order_id == order_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        trades.sort_by_key(|t| t.id);
        trades
    }

    /// A user's retained trades, optionally scoped to a symbol, newest first.
    pub fn by_user(&self, user_id: i64, symbol: Option<&str>, limit: usize) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .by_symbol
            .iter()
            .filter(|entry| symbol.map_or(true, |s| entry.key() == s))
            .flat_map(|entry| {
                entry
                    .value()
                    .lock()
                    .iter()
                    .filter(|t| t.buyer_user_id == user_id || t.seller_user_id == user_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        trades.sort_by(|a, b| b.id.cmp(&a.id));
        trades.truncate(limit);
        trades
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(id: i64, symbol: &str, buyer: i64, seller: i64, buy_order: i64, sell_order: i64) -> Trade {
        Trade {
            id,
            trading_pair_id: 1,
            symbol: symbol.to_string(),
            buy_order_id: buy_order,
            sell_order_id: sell_order,
            buyer_user_id: buyer,
            seller_user_id: seller,
            price: dec!(50000),
            quantity: dec!(0.01),
            fee: dec!(0),
            fee_asset: "USDT".to_string(),
            executed_at: id,
        }
    }

    #[test]
    fn test_recent_newest_first() {
        let history = TradeHistory::new(100);
        for id in 1..=5 {
            history.record(trade(id, "BTCUSDT", 1, 2, 10, 20));
        }
        let recent = history.recent("BTCUSDT", 3);
        let ids: Vec<i64> = recent.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let history = TradeHistory::new(3);
        for id in 1..=5 {
            history.record(trade(id, "BTCUSDT", 1, 2, 10, 20));
        }
        let ids: Vec<i64> = history
            .recent("BTCUSDT", 10)
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn test_by_order_both_sides() {
        let history = TradeHistory::new(100);
        history.record(trade(1, "BTCUSDT", 1, 2, 10, 20));
        history.record(trade(2, "BTCUSDT", 3, 4, 30, 40));
        history.record(trade(3, "BTCUSDT", 5, 1, 50, 10));

        let trades = history.by_order(10);
        let ids: Vec<i64> = trades.iter().map(|t| t.id).collect();
        // Order 10 bought in trade 1 and sold in trade 3.
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_by_user_scoped_by_symbol() {
        let history = TradeHistory::new(100);
        history.record(trade(1, "BTCUSDT", 1, 2, 10, 20));
        history.record(trade(2, "ETHUSDT", 1, 3, 11, 21));
        history.record(trade(3, "BTCUSDT", 4, 1, 12, 22));

        assert_eq!(history.by_user(1, None, 10).len(), 3);
        assert_eq!(history.by_user(1, Some("BTCUSDT"), 10).len(), 2);
        assert_eq!(history.by_user(1, Some("BTCUSDT"), 1).len(), 1);
        assert!(history.by_user(9, None, 10).is_empty());
    }
}
