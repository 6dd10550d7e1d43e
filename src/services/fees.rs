//! Fee Schedule
//!
//! A single proportional fee model: `fee = quantity * price * rate`, charged
//! in the quote asset and deducted from the seller's quote credit. Per-pair
//! overrides come from configuration.

use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;

/// Fees are settled in quote units, rounded down to this many fractional
/// digits so the ledger never credits more than the buyer paid.
const FEE_SCALE: u32 = 8;

pub struct FeeSchedule {
    default_rate: Decimal,
    per_pair: RwLock<HashMap<String, Decimal>>,
}

impl FeeSchedule {
    pub fn new(default_rate: Decimal) -> Self {
        Self {
            default_rate,
            per_pair: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_pair_rate(&self, symbol: &str, rate: Decimal) {
        self.per_pair.write().insert(symbol.to_string(), rate);
    }

    pub fn rate_for(&self, symbol: &str) -> Decimal {
        self.per_pair
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(self.default_rate)
    }

    /// Fee for a fill of `quantity` at `price` on `symbol`, in quote units.
    pub fn fee_for(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Decimal {
        (quantity * price * self.rate_for(symbol))
            .round_dp_with_strategy(FEE_SCALE, RoundingStrategy::ToZero)
    }
}
