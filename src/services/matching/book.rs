//! Order Book
//!
//! Two price-sorted ladders of resting limit orders for one trading pair.
//! Bids match best-first in descending price order, asks in ascending order;
//! within a level, arrival order (FIFO) gives time priority. The book is not
//! internally synchronized: it is owned by the engine's per-symbol
//! serialisation point.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};

use super::types::{BookOrder, DepthLevels, PriceKey};
use crate::models::OrderSide;

#[derive(Debug, Default)]
pub struct OrderBook {
    /// Price -> FIFO queue of resting orders. Best bid = last key.
    bids: BTreeMap<PriceKey, VecDeque<BookOrder>>,
    /// Best ask = first key.
    asks: BTreeMap<PriceKey, VecDeque<BookOrder>>,
    /// order_id -> (side, level) for O(log L) removal.
    index: HashMap<i64, (OrderSide, PriceKey)>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn ladder(&self, side: OrderSide) -> &BTreeMap<PriceKey, VecDeque<BookOrder>> {
        match side {
            OrderSide::Buy => &self.bids,
            OrderSide::Sell => &self.asks,
        }
    }

    fn ladder_mut(&mut self, side: OrderSide) -> &mut BTreeMap<PriceKey, VecDeque<BookOrder>> {
        match side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        }
    }

    /// Rest an order at its price level, behind earlier arrivals.
    pub fn insert(&mut self, side: OrderSide, order: BookOrder) {
        debug_assert!(order.remaining > Decimal::ZERO);
        let key = PriceKey::from_decimal(order.price);
        self.index.insert(order.order_id, (side, key));
        self.ladder_mut(side).entry(key).or_default().push_back(order);
    }

    /// Remove an order wherever it rests. Used for cancellation.
    pub fn remove(&mut self, order_id: i64) -> Option<(OrderSide, BookOrder)> {
        let (side, key) = self.index.remove(&order_id)?;
        let ladder = self.ladder_mut(side);
        let queue = ladder.get_mut(&key)?;
        let pos = queue.iter().position(|o| o.order_id == order_id)?;
        let order = queue.remove(pos)?;
        if queue.is_empty() {
            ladder.remove(&key);
        }
        Some((side, order))
    }

    pub fn contains(&self, order_id: i64) -> bool {
        self.index.contains_key(&order_id)
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().map(PriceKey::to_decimal)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().map(PriceKey::to_decimal)
    }

    /// (best bid + best ask) / 2 when both sides exist.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Level keys on the side opposing `taker_side`, in match-priority order,
    /// truncated to those crossable at `limit_price` (all levels when None).
    pub fn crossable_levels(
        &self,
        taker_side: OrderSide,
        limit_price: Option<Decimal>,
    ) -> Vec<PriceKey> {
        match taker_side {
            // A buyer lifts asks from the cheapest up.
            OrderSide::Buy => self
                .asks
                .keys()
                .take_while(|key| limit_price.map_or(true, |limit| key.to_decimal() <= limit))
                .copied()
                .collect(),
            // A seller hits bids from the dearest down.
            OrderSide::Sell => self
                .bids
                .keys()
                .rev()
                .take_while(|key| limit_price.map_or(true, |limit| key.to_decimal() >= limit))
                .copied()
                .collect(),
        }
    }

    /// Mutable access to one price level's queue on the side opposing
    /// `taker_side`. The engine walks and shrinks it during matching.
    pub fn opposite_level_mut(
        &mut self,
        taker_side: OrderSide,
        key: PriceKey,
    ) -> Option<&mut VecDeque<BookOrder>> {
        self.ladder_mut(taker_side.opposite()).get_mut(&key)
    }

    /// Drop an emptied level on the side opposing `taker_side`.
    pub fn prune_opposite_level(&mut self, taker_side: OrderSide, key: PriceKey) {
        let ladder = self.ladder_mut(taker_side.opposite());
        if ladder.get(&key).is_some_and(|q| q.is_empty()) {
            ladder.remove(&key);
        }
    }

    /// Forget an order the engine consumed directly from a level queue.
    pub fn drop_index(&mut self, order_id: i64) {
        self.index.remove(&order_id);
    }

    /// Current aggregate quantity at a price level; zero if the level is
    /// gone. Drives the delta broadcasts.
    pub fn level_quantity(&self, side: OrderSide, key: PriceKey) -> Decimal {
        self.ladder(side)
            .get(&key)
            .map(|queue| queue.iter().map(|o| o.remaining).sum())
            .unwrap_or(Decimal::ZERO)
    }

    /// Aggregate quantities at the given levels, first occurrence per level,
    /// in input order. Zero quantity means the level vanished.
    pub fn levels_at(
        &self,
        refs: impl IntoIterator<Item = (OrderSide, PriceKey)>,
    ) -> Vec<(OrderSide, Decimal, Decimal)> {
        let mut seen = std::collections::HashSet::new();
        refs.into_iter()
            .filter(|level| seen.insert(*level))
            .map(|(side, key)| (side, key.to_decimal(), self.level_quantity(side, key)))
            .collect()
    }

    /// Top-`n` aggregated levels: bids descending, asks ascending.
    pub fn depth_snapshot(&self, n: usize) -> (DepthLevels, DepthLevels) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(key, queue)| {
                (key.to_decimal(), queue.iter().map(|o| o.remaining).sum())
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(n)
            .map(|(key, queue)| {
                (key.to_decimal(), queue.iter().map(|o| o.remaining).sum())
            })
            .collect();
        (bids, asks)
    }

    /// Sum of worst-case notional needed to buy `quantity` walking the asks
    /// top-down. Returns the notional for whatever part of `quantity` the
    /// book can cover, plus the covered quantity itself.
    pub fn walk_ask_notional(&self, quantity: Decimal) -> (Decimal, Decimal) {
        let mut wanted = quantity;
        let mut notional = Decimal::ZERO;
        for (key, queue) in self.asks.iter() {
            if wanted <= Decimal::ZERO {
                break;
            }
            let level_qty: Decimal = queue.iter().map(|o| o.remaining).sum();
            let take = wanted.min(level_qty);
            notional += take * key.to_decimal();
            wanted -= take;
        }
        (notional, quantity - wanted)
    }

    #[cfg(test)]
    pub fn assert_well_formed(&self) {
        let mut seen = std::collections::HashSet::new();
        for (side, ladder) in [(OrderSide::Buy, &self.bids), (OrderSide::Sell, &self.asks)] {
            for (key, queue) in ladder {
                assert!(!queue.is_empty(), "empty level left behind");
                for order in queue {
                    assert!(order.remaining > Decimal::ZERO);
                    assert!(seen.insert(order.order_id), "order on both sides");
                    assert_eq!(self.index.get(&order.order_id), Some(&(side, *key)));
                }
            }
        }
        assert_eq!(seen.len(), self.index.len());
    }
}
