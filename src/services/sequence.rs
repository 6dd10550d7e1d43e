//! Identifier Allocation
//!
//! Process-wide monotonic ids for orders and trades. No gaps guaranteed,
//! only strict monotonicity within a process lifetime. On restart the
//! recovery loader reseeds the counters above the durable maxima.

use std::sync::atomic::{AtomicI64, Ordering};

pub struct IdAllocator {
    next_order_id: AtomicI64,
    next_trade_id: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_order_id: AtomicI64::new(1),
            next_trade_id: AtomicI64::new(1),
        }
    }

    pub fn next_order_id(&self) -> i64 {
        self.next_order_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_trade_id(&self) -> i64 {
        self.next_trade_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reseed counters so that the next allocated ids are strictly above the
    /// given durable maxima. Never moves a counter backwards.
    pub fn seed(&self, max_order_id: i64, max_trade_id: i64) {
        self.next_order_id.fetch_max(max_order_id + 1, Ordering::Relaxed);
        self.next_trade_id.fetch_max(max_trade_id + 1, Ordering::Relaxed);
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let ids = IdAllocator::new();
        let a = ids.next_order_id();
        let b = ids.next_order_id();
        assert!(b > a);

        let t1 = ids.next_trade_id();
        let t2 = ids.next_trade_id();
        assert!(t2 > t1);
    }

    #[test]
    fn test_seed_resumes_above_maxima() {
        let ids = IdAllocator::new();
        ids.seed(1000, 5000);
        assert_eq!(ids.next_order_id(), 1001);
        assert_eq!(ids.next_trade_id(), 5001);
    }

    #[test]
    fn test_seed_never_goes_backwards() {
        let ids = IdAllocator::new();
        ids.seed(1000, 1000);
        ids.seed(10, 10);
        assert_eq!(ids.next_order_id(), 1001);
        assert_eq!(ids.next_trade_id(), 1001);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let ids = Arc::new(IdAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = Arc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| ids.next_order_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate order id {}", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
