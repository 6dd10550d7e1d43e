//! Durable Store Sync Worker
//!
//! The single background writer draining the write queues into Postgres on a
//! fixed interval. Each tick re-reads the authoritative in-memory state for
//! order and asset keys, so the store converges on the cache; trade entries
//! carry their immutable payloads. A failed batch is requeued in order and
//! retried next tick; the matching path is never stalled by the store.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::db::store;
use crate::services::assets::AssetLedger;
use crate::services::orders::OrderStore;
use crate::services::writeback::WriteQueue;

pub struct StoreSyncWorker {
    pool: PgPool,
    queue: Arc<WriteQueue>,
    orders: Arc<OrderStore>,
    ledger: Arc<AssetLedger>,
    flush_interval: Duration,
    batch_size: usize,
    /// One flag per category so each failure class logs once, not per tick.
    failing: [bool; 3],
}

const CAT_TRADES: usize = 0;
const CAT_ORDERS: usize = 1;
const CAT_ASSETS: usize = 2;
const CATEGORY_NAMES: [&str; 3] = ["trades", "orders", "assets"];

impl StoreSyncWorker {
    pub fn new(
        pool: PgPool,
        queue: Arc<WriteQueue>,
        orders: Arc<OrderStore>,
        ledger: Arc<AssetLedger>,
        flush_interval_ms: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            pool,
            queue,
            orders,
            ledger,
            flush_interval: Duration::from_millis(flush_interval_ms),
            batch_size,
            failing: [false; 3],
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.flush_interval.as_millis() as u64,
                batch_size = self.batch_size,
                "store sync worker started"
            );
            let mut interval = tokio::time::interval(self.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    /// One flush pass. Trades go first: they are the only entries whose loss
    /// cannot be rebuilt from in-memory state.
    pub async fn tick(&mut self) {
        self.flush_trades().await;
        self.flush_orders().await;
        self.flush_assets().await;

        crate::metrics::set_pending_writes(
            self.queue.pending_orders(),
            self.queue.pending_trades(),
            self.queue.pending_assets(),
        );
    }

    async fn flush_trades(&mut self) {
        let batch = self.queue.drain_trades(self.batch_size);
        if batch.is_empty() {
            return;
        }
        let count = batch.len();

        let result = async {
            let mut tx = self.pool.begin().await?;
            for trade in &batch {
                store::insert_trade(&mut tx, trade).await?;
            }
            tx.commit().await
        }
        .await;

        match result {
            Ok(()) => {
                self.note_recovery(CAT_TRADES);
                crate::metrics::record_flush("trades", count);
                debug!(count, "flushed trades");
            }
            Err(err) => {
                self.queue.requeue_trades(batch);
                self.note_failure(CAT_TRADES, &err);
            }
        }
    }

    async fn flush_orders(&mut self) {
        let ids = self.queue.drain_orders(self.batch_size);
        if ids.is_empty() {
            return;
        }
        let count = ids.len();

        let result = async {
            let mut tx = self.pool.begin().await?;
            for id in &ids {
                // The entry is a key: re-read the authoritative state now.
                if let Some(order) = self.orders.get(*id) {
                    store::upsert_order(&mut tx, &order).await?;
                }
            }
            tx.commit().await
        }
        .await;

        match result {
            Ok(()) => {
                self.note_recovery(CAT_ORDERS);
                crate::metrics::record_flush("orders", count);
                debug!(count, "flushed orders");
            }
            Err(err) => {
                self.queue.requeue_orders(ids);
                self.note_failure(CAT_ORDERS, &err);
            }
        }
    }

    async fn flush_assets(&mut self) {
        let keys = self.queue.drain_assets(self.batch_size);
        if keys.is_empty() {
            return;
        }
        let count = keys.len();

        let result = async {
            let mut tx = self.pool.begin().await?;
            for (user_id, symbol) in &keys {
                if let Some(view) = self.ledger.get(*user_id, symbol) {
                    store::upsert_asset(&mut tx, &view).await?;
                }
            }
            tx.commit().await
        }
        .await;

        match result {
            Ok(()) => {
                self.note_recovery(CAT_ASSETS);
                crate::metrics::record_flush("assets", count);
                debug!(count, "flushed asset snapshots");
            }
            Err(err) => {
                self.queue.requeue_assets(keys);
                self.note_failure(CAT_ASSETS, &err);
            }
        }
    }

    fn note_failure(&mut self, category: usize, err: &sqlx::Error) {
        crate::metrics::record_flush_failure(CATEGORY_NAMES[category]);
        if !self.failing[category] {
            self.failing[category] = true;
            error!(
                category = CATEGORY_NAMES[category],
                %err,
                "store flush failed; batch requeued for next tick"
            );
        } else {
            debug!(
                category = CATEGORY_NAMES[category],
                %err,
                "store flush still failing"
            );
        }
    }

    fn note_recovery(&mut self, category: usize) {
        if self.failing[category] {
            self.failing[category] = false;
            info!(
                category = CATEGORY_NAMES[category],
                "store flush recovered"
            );
        }
    }
}
