//! Durable Store Statements
//!
//! The relational contract this service expects (migrations are managed
//! outside this repo):
//!
//! ```text
//! users         (id BIGSERIAL PK, username TEXT UNIQUE, email TEXT NULL UNIQUE,
//!                password_hash TEXT, is_active BOOL, created_at, updated_at)
//! trading_pairs (id BIGSERIAL PK, symbol TEXT UNIQUE, base_asset, quote_asset,
//!                min_qty NUMERIC, max_qty NUMERIC, price_precision INT,
//!                qty_precision INT, is_active BOOL, created_at)
//! assets        (user_id BIGINT, symbol TEXT, available NUMERIC, frozen NUMERIC,
//!                updated_at, UNIQUE (user_id, symbol))
//! orders        (id BIGINT PK, user_id, trading_pair_id, symbol, side order_side,
//!                order_type order_type, price NUMERIC NULL, quantity NUMERIC,
//!                filled_quantity NUMERIC, average_fill_price NUMERIC NULL,
//!                status order_status, client_order_id TEXT NULL,
//!                created_at, updated_at)
//! trades        (id BIGINT PK, trading_pair_id, symbol, buy_order_id,
//!                sell_order_id, buyer_user_id, seller_user_id, price NUMERIC,
//!                quantity NUMERIC, fee NUMERIC, fee_asset TEXT, executed_at BIGINT)
//! ```
//!
//! All writes are idempotent upserts so the sync worker can retry a batch
//! after a transient failure without duplicating rows.

use chrono::Utc;
use sqlx::PgPool;

use crate::models::{Asset, AssetView, Order, Trade, TradingPair};

pub async fn upsert_order(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    order: &Order,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO orders
            (id, user_id, trading_pair_id, symbol, side, order_type, price,
             quantity, filled_quantity, average_fill_price, status,
             client_order_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (id) DO UPDATE SET
            filled_quantity = $9,
            average_fill_price = $10,
            status = $11,
            updated_at = $14
        "#,
    )
    .bind(order.id)
    .bind(order.user_id)
    .bind(order.trading_pair_id)
    .bind(&order.symbol)
    .bind(order.side)
    .bind(order.order_type)
    .bind(order.price)
    .bind(order.quantity)
    .bind(order.filled_quantity)
    .bind(order.average_fill_price)
    .bind(order.status)
    .bind(&order.client_order_id)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Trades are immutable; a retried batch hits the conflict arm and no-ops.
pub async fn insert_trade(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    trade: &Trade,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO trades
            (id, trading_pair_id, symbol, buy_order_id, sell_order_id,
             buyer_user_id, seller_user_id, price, quantity, fee, fee_asset,
             executed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(trade.id)
    .bind(trade.trading_pair_id)
    .bind(&trade.symbol)
    .bind(trade.buy_order_id)
    .bind(trade.sell_order_id)
    .bind(trade.buyer_user_id)
    .bind(trade.seller_user_id)
    .bind(trade.price)
    .bind(trade.quantity)
    .bind(trade.fee)
    .bind(&trade.fee_asset)
    .bind(trade.executed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn upsert_asset(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    view: &AssetView,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO assets (user_id, symbol, available, frozen, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, symbol) DO UPDATE SET
            available = $3,
            frozen = $4,
            updated_at = $5
        "#,
    )
    .bind(view.user_id)
    .bind(&view.symbol)
    .bind(view.available)
    .bind(view.frozen)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn insert_trading_pair(
    pool: &PgPool,
    pair: &crate::models::CreateTradingPairRequest,
) -> Result<TradingPair, sqlx::Error> {
    sqlx::query_as(
        r#"
        INSERT INTO trading_pairs
            (symbol, base_asset, quote_asset, min_qty, max_qty,
             price_precision, qty_precision, is_active, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, NOW())
        RETURNING id, symbol, base_asset, quote_asset, min_qty, max_qty,
                  price_precision, qty_precision, is_active, created_at
        "#,
    )
    .bind(&pair.symbol)
    .bind(&pair.base_asset)
    .bind(&pair.quote_asset)
    .bind(pair.min_qty)
    .bind(pair.max_qty)
    .bind(pair.price_precision)
    .bind(pair.qty_precision)
    .fetch_one(pool)
    .await
}

// ============================================================================
// Recovery reads
// ============================================================================

pub async fn load_trading_pairs(pool: &PgPool) -> Result<Vec<TradingPair>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, symbol, base_asset, quote_asset, min_qty, max_qty, \
         price_precision, qty_precision, is_active, created_at \
         FROM trading_pairs ORDER BY id",
    )
    .fetch_all(pool)
    .await
}

pub async fn load_assets(pool: &PgPool) -> Result<Vec<Asset>, sqlx::Error> {
    sqlx::query_as("SELECT user_id, symbol, available, frozen, updated_at FROM assets")
        .fetch_all(pool)
        .await
}

/// Orders still live at the moment of the last flush.
pub async fn load_open_orders(pool: &PgPool) -> Result<Vec<Order>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, user_id, trading_pair_id, symbol, side, order_type, price, \
         quantity, filled_quantity, average_fill_price, status, client_order_id, \
         created_at, updated_at \
         FROM orders \
         WHERE status IN ('pending', 'active', 'partially_filled') \
         ORDER BY created_at, id",
    )
    .fetch_all(pool)
    .await
}

pub async fn max_order_id(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM orders")
        .fetch_one(pool)
        .await?;
    Ok(row.0.unwrap_or(0))
}

pub async fn max_trade_id(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM trades")
        .fetch_one(pool)
        .await?;
    Ok(row.0.unwrap_or(0))
}
