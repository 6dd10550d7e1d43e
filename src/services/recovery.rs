//! Recovery Loader
//!
//! Rebuilds the authoritative in-memory tier from the durable store before
//! the service accepts traffic: trading pairs, balance records, open orders
//! (back onto their books at original time priority), and the id counters
//! seeded above the durable maxima. The caller only binds the listener once
//! this returns, which is the readiness gate.

use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::store;
use crate::models::OrderType;
use crate::services::assets::AssetLedger;
use crate::services::matching::MatchingEngine;
use crate::services::orders::OrderStore;
use crate::services::sequence::IdAllocator;

#[derive(Debug, Default)]
pub struct RecoverySummary {
    pub pairs: usize,
    pub assets: usize,
    pub open_orders: usize,
    pub max_order_id: i64,
    pub max_trade_id: i64,
}

#[allow(clippy::too_many_arguments)]
pub async fn load(
    pool: &PgPool,
    supported_symbols: &[String],
    engine: &MatchingEngine,
    ledger: &Arc<AssetLedger>,
    orders: &Arc<OrderStore>,
    ids: &Arc<IdAllocator>,
) -> anyhow::Result<RecoverySummary> {
    let mut summary = RecoverySummary::default();

    // 1. Trading pairs.
    for pair in store::load_trading_pairs(pool).await? {
        if !supported_symbols.is_empty() && !supported_symbols.contains(&pair.symbol) {
            warn!(symbol = %pair.symbol, "pair present in store but not in supported_symbols; skipping");
            continue;
        }
        engine.register_pair(pair);
        summary.pairs += 1;
    }

    // 2. Balance records.
    for asset in store::load_assets(pool).await? {
        ledger.load_recovered(&asset);
        summary.assets += 1;
    }

    // 3. Open orders, oldest first so book time priority is reproduced.
    for order in store::load_open_orders(pool).await? {
        let is_limit = order.order_type == OrderType::Limit;
        orders.load_recovered(order.clone());
        if is_limit {
            if let Err(err) = engine.insert_recovered(&order).await {
                warn!(order_id = order.id, %err, "could not re-book recovered order");
                continue;
            }
        }
        summary.open_orders += 1;
    }

    // 4. Seed the id allocator above everything the store has seen.
    summary.max_order_id = store::max_order_id(pool).await?;
    summary.max_trade_id = store::max_trade_id(pool).await?;
    ids.seed(summary.max_order_id, summary.max_trade_id);

    info!(
        pairs = summary.pairs,
        assets = summary.assets,
        open_orders = summary.open_orders,
        max_order_id = summary.max_order_id,
        max_trade_id = summary.max_trade_id,
        "recovery complete"
    );
    Ok(summary)
}
