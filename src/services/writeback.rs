//! Write Queues
//!
//! Durable-intent queues feeding the store sync worker. Order and asset
//! entries are keys: the worker re-reads the authoritative in-memory state at
//! flush time, so coalescing duplicates is always safe. Trade entries carry
//! the immutable trade payload and are never dropped.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

use crate::models::Trade;

/// Key of an asset snapshot entry.
pub type AssetKey = (i64, String);

pub struct WriteQueue {
    orders: Mutex<VecDeque<i64>>,
    trades: Mutex<VecDeque<Trade>>,
    assets: Mutex<VecDeque<AssetKey>>,
    /// Soft bound for the key queues. Because keys coalesce at drain time,
    /// overflow drops only duplicates-in-waiting, never distinct intent.
    capacity: usize,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            orders: Mutex::new(VecDeque::new()),
            trades: Mutex::new(VecDeque::new()),
            assets: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Record that an order must be re-read and upserted.
    pub fn push_order(&self, order_id: i64) {
        let mut queue = self.orders.lock();
        if queue.len() >= self.capacity {
            // The state will still be flushed: the newest entry for the same
            // id supersedes older ones, and drain dedups anyway.
            if queue.contains(&order_id) {
                return;
            }
        }
        queue.push_back(order_id);
    }

    /// Record a created trade. Enqueued by the engine before it releases the
    /// per-symbol serialisation point; unbounded so trades are never lost.
    pub fn push_trade(&self, trade: Trade) {
        self.trades.lock().push_back(trade);
    }

    /// Record that an asset record must be re-read and upserted.
    pub fn push_asset(&self, user_id: i64, symbol: &str) {
        let mut queue = self.assets.lock();
        let key = (user_id, symbol.to_string());
        if queue.len() >= self.capacity && queue.contains(&key) {
            return;
        }
        queue.push_back(key);
    }

    /// Drain up to `max` order ids, deduplicated, FIFO by first occurrence.
    pub fn drain_orders(&self, max: usize) -> Vec<i64> {
        let mut queue = self.orders.lock();
        let mut seen = HashSet::new();
        let mut drained = Vec::new();
        while drained.len() < max {
            match queue.pop_front() {
                Some(id) => {
                    if seen.insert(id) {
                        drained.push(id);
                    }
                }
                None => break,
            }
        }
        drained
    }

    pub fn drain_trades(&self, max: usize) -> Vec<Trade> {
        let mut queue = self.trades.lock();
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Drain up to `max` asset keys, coalesced by `(user_id, symbol)`. The
    /// worker reads the latest state per key, so latest-wins is implicit.
    pub fn drain_assets(&self, max: usize) -> Vec<AssetKey> {
        let mut queue = self.assets.lock();
        let mut seen = HashSet::new();
        let mut drained = Vec::new();
        while drained.len() < max {
            match queue.pop_front() {
                Some(key) => {
                    if seen.insert(key.clone()) {
                        drained.push(key);
                    }
                }
                None => break,
            }
        }
        drained
    }

    // Failure path: the sync worker puts a failed batch back at the front so
    // the next tick retries in the original order.

    pub fn requeue_orders(&self, ids: Vec<i64>) {
        let mut queue = self.orders.lock();
        for id in ids.into_iter().rev() {
            queue.push_front(id);
        }
    }

    pub fn requeue_trades(&self, trades: Vec<Trade>) {
        let mut queue = self.trades.lock();
        for trade in trades.into_iter().rev() {
            queue.push_front(trade);
        }
    }

    pub fn requeue_assets(&self, keys: Vec<AssetKey>) {
        let mut queue = self.assets.lock();
        for key in keys.into_iter().rev() {
            queue.push_front(key);
        }
    }

    pub fn pending_orders(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn pending_trades(&self) -> usize {
        self.trades.lock().len()
    }

    pub fn pending_assets(&self) -> usize {
        self.assets.lock().len()
    }
}
