//! Asset Ledger
//!
//! Authoritative in-memory balance records, keyed `(user_id, symbol)`. Each
//! record is guarded by its own mutex; multi-key settlement locks records in
//! globally sorted key order so two users trading simultaneously can never
//! deadlock. Every mutation enqueues an asset snapshot for the store sync
//! worker and publishes a user-asset event.

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{Asset, AssetView};
use crate::services::events::{EventPublisher, UserAssetUpdate};
use crate::services::writeback::{AssetKey, WriteQueue};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: user {user_id} needs {needed} {symbol}, has {available}")]
    InsufficientFunds {
        user_id: i64,
        symbol: String,
        needed: Decimal,
        available: Decimal,
    },

    /// A frozen-balance precondition believed unreachable was violated.
    #[error("inconsistent ledger state: {0}")]
    InconsistentState(String),
}

#[derive(Debug, Default)]
struct AssetRecord {
    available: Decimal,
    frozen: Decimal,
}

impl AssetRecord {
    fn view(&self, user_id: i64, symbol: &str) -> AssetView {
        AssetView::new(user_id, symbol.to_string(), self.available, self.frozen)
    }
}

pub struct AssetLedger {
    records: DashMap<AssetKey, Arc<Mutex<AssetRecord>>>,
    queue: Arc<WriteQueue>,
    events: Arc<EventPublisher>,
}

/// The ledger legs of one trade. Quantities are positive; `fee` is in quote
/// units and reduces the seller's credit.
#[derive(Debug)]
pub struct TradeSettlement<'a> {
    pub buyer_user_id: i64,
    pub seller_user_id: i64,
    pub base_asset: &'a str,
    pub quote_asset: &'a str,
    pub base_quantity: Decimal,
    pub quote_quantity: Decimal,
    pub fee: Decimal,
}

impl AssetLedger {
    pub fn new(queue: Arc<WriteQueue>, events: Arc<EventPublisher>) -> Self {
        Self {
            records: DashMap::new(),
            queue,
            events,
        }
    }

    /// Records are created lazily on first credit or freeze, never deleted.
    fn record(&self, user_id: i64, symbol: &str) -> Arc<Mutex<AssetRecord>> {
        self.records
            .entry((user_id, symbol.to_string()))
            .or_default()
            .clone()
    }

    fn after_mutation(&self, user_id: i64, symbol: &str, view: AssetView) {
        self.queue.push_asset(user_id, symbol);
        self.events.publish_user_assets(UserAssetUpdate {
            user_id,
            assets: vec![view],
        });
    }

    /// Move `amount` from available to frozen.
    pub fn freeze(&self, user_id: i64, symbol: &str, amount: Decimal) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }
        if amount < Decimal::ZERO {
            return Err(LedgerError::InconsistentState(format!(
                "negative freeze amount {} for user {} {}",
                amount, user_id, symbol
            )));
        }

        let record = self.record(user_id, symbol);
        let view = {
            let mut rec = record.lock();
            if rec.available < amount {
                return Err(LedgerError::InsufficientFunds {
                    user_id,
                    symbol: symbol.to_string(),
                    needed: amount,
                    available: rec.available,
                });
            }
            rec.available -= amount;
            rec.frozen += amount;
            rec.view(user_id, symbol)
        };
        self.after_mutation(user_id, symbol, view);
        Ok(())
    }

    /// Move `amount` from frozen back to available.
    pub fn unfreeze(&self, user_id: i64, symbol: &str, amount: Decimal) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }
        if amount < Decimal::ZERO {
            return Err(LedgerError::InconsistentState(format!(
                "negative unfreeze amount {} for user {} {}",
                amount, user_id, symbol
            )));
        }

        let record = self.record(user_id, symbol);
        let view = {
            let mut rec = record.lock();
            if rec.frozen < amount {
                return Err(LedgerError::InconsistentState(format!(
                    "unfreeze {} {} for user {} exceeds frozen {}",
                    amount, symbol, user_id, rec.frozen
                )));
            }
            rec.frozen -= amount;
            rec.available += amount;
            rec.view(user_id, symbol)
        };
        self.after_mutation(user_id, symbol, view);
        Ok(())
    }

    /// Consume `amount` out of frozen without returning it to available.
    pub fn debit_from_frozen(
        &self,
        user_id: i64,
        symbol: &str,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }
        if amount < Decimal::ZERO {
            return Err(LedgerError::InconsistentState(format!(
                "negative debit amount {} for user {} {}",
                amount, user_id, symbol
            )));
        }

        let record = self.record(user_id, symbol);
        let view = {
            let mut rec = record.lock();
            if rec.frozen < amount {
                return Err(LedgerError::InconsistentState(format!(
                    "debit {} {} for user {} exceeds frozen {}",
                    amount, symbol, user_id, rec.frozen
                )));
            }
            rec.frozen -= amount;
            rec.view(user_id, symbol)
        };
        self.after_mutation(user_id, symbol, view);
        Ok(())
    }

    /// Add `amount` to available. Never fails for positive amounts.
    pub fn credit(&self, user_id: i64, symbol: &str, amount: Decimal) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }
        if amount < Decimal::ZERO {
            return Err(LedgerError::InconsistentState(format!(
                "negative credit amount {} for user {} {}",
                amount, user_id, symbol
            )));
        }

        let record = self.record(user_id, symbol);
        let view = {
            let mut rec = record.lock();
            rec.available += amount;
            rec.view(user_id, symbol)
        };
        self.after_mutation(user_id, symbol, view);
        Ok(())
    }

    pub fn has_available(&self, user_id: i64, symbol: &str, amount: Decimal) -> bool {
        match self.records.get(&(user_id, symbol.to_string())) {
            Some(record) => record.lock().available >= amount,
            None => amount <= Decimal::ZERO,
        }
    }

    pub fn get(&self, user_id: i64, symbol: &str) -> Option<AssetView> {
        self.records
            .get(&(user_id, symbol.to_string()))
            .map(|record| record.lock().view(user_id, symbol))
    }

    pub fn list_by_user(&self, user_id: i64) -> Vec<AssetView> {
        let mut views: Vec<AssetView> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.value().lock().view(user_id, &entry.key().1))
            .collect();
        views.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        views
    }

    /// Upsert starting balances, used for onboarding and for seeding the
    /// market-maker account. Idempotent: applying the same values twice
    /// leaves the ledger unchanged.
    pub fn initialize_user_assets(&self, user_id: i64, balances: &[(String, Decimal)]) {
        for (symbol, amount) in balances {
            let record = self.record(user_id, symbol);
            let changed = {
                let mut rec = record.lock();
                if rec.available == *amount {
                    None
                } else {
                    rec.available = *amount;
                    Some(rec.view(user_id, symbol))
                }
            };
            if let Some(view) = changed {
                self.after_mutation(user_id, symbol, view);
            }
        }
    }

    /// Populate a record from the durable store at recovery time. Does not
    /// enqueue writes or publish events.
    pub fn load_recovered(&self, asset: &Asset) {
        let record = self.record(asset.user_id, &asset.symbol);
        let mut rec = record.lock();
        rec.available = asset.available;
        rec.frozen = asset.frozen;
    }

    /// Apply the four ledger legs of one trade atomically.
    ///
    /// All touched records are locked in sorted key order, both frozen-side
    /// preconditions are validated, and only then are the debits and credits
    /// applied; no partially settled state is ever observable and a failed
    /// precondition leaves the ledger untouched.
    pub fn settle_trade(&self, settlement: &TradeSettlement<'_>) -> Result<(), LedgerError> {
        let buyer_quote = (settlement.buyer_user_id, settlement.quote_asset.to_string());
        let seller_base = (settlement.seller_user_id, settlement.base_asset.to_string());
        let buyer_base = (settlement.buyer_user_id, settlement.base_asset.to_string());
        let seller_quote = (settlement.seller_user_id, settlement.quote_asset.to_string());

        let mut keys = vec![
            buyer_quote.clone(),
            seller_base.clone(),
            buyer_base.clone(),
            seller_quote.clone(),
        ];
        keys.sort();
        keys.dedup();

        let records: Vec<Arc<Mutex<AssetRecord>>> = keys
            .iter()
            .map(|(user_id, symbol)| self.record(*user_id, symbol))
            .collect();

        let views = {
            let mut guards: Vec<_> = records.iter().map(|record| record.lock()).collect();
            let index = |key: &AssetKey| keys.iter().position(|k| k == key).unwrap();

            let bq = index(&buyer_quote);
            let sb = index(&seller_base);
            let bb = index(&buyer_base);
            let sq = index(&seller_quote);

            if guards[bq].frozen < settlement.quote_quantity {
                return Err(LedgerError::InconsistentState(format!(
                    "buyer {} frozen {} {} below trade notional {}",
                    settlement.buyer_user_id,
                    guards[bq].frozen,
                    settlement.quote_asset,
                    settlement.quote_quantity
                )));
            }
            if guards[sb].frozen < settlement.base_quantity {
                return Err(LedgerError::InconsistentState(format!(
                    "seller {} frozen {} {} below trade quantity {}",
                    settlement.seller_user_id,
                    guards[sb].frozen,
                    settlement.base_asset,
                    settlement.base_quantity
                )));
            }

            // Debits first, credits second.
            guards[bq].frozen -= settlement.quote_quantity;
            guards[sb].frozen -= settlement.base_quantity;
            guards[bb].available += settlement.base_quantity;
            guards[sq].available += settlement.quote_quantity - settlement.fee;

            keys.iter()
                .enumerate()
                .map(|(i, (user_id, symbol))| guards[i].view(*user_id, symbol))
                .collect::<Vec<_>>()
        };

        for view in views {
            let user_id = view.user_id;
            let symbol = view.symbol.clone();
            self.after_mutation(user_id, &symbol, view);
        }
        Ok(())
    }

    /// Sum of `available + frozen` across all users for one symbol. Used by
    /// the conservation checks in tests and diagnostics.
    pub fn total_supply(&self, symbol: &str) -> Decimal {
        self.records
            .iter()
            .filter(|entry| entry.key().1 == symbol)
            .map(|entry| {
                let rec = entry.value().lock();
                rec.available + rec.frozen
            })
            .sum()
    }
}
