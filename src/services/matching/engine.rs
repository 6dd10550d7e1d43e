//! Matching Engine
//!
//! Serialised per trading pair: one `tokio::sync::Mutex` per symbol guards
//! the book, and every mutating operation runs inside it. The critical
//! section contains no `.await`, so an operation cancelled (dropped) before
//! lock acquisition has zero side effects, and once state begins to change
//! it always runs to completion.
//!
//! Settlement happens inline during the match loop through the asset ledger;
//! trade intents are enqueued for the store sync worker before the
//! serialisation point is released, so a published trade is never lost to a
//! clean shutdown.

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::book::OrderBook;
use super::types::{
    BookOrder, CancelAllOutcome, DepthSnapshot, ExchangeError, LevelRef, MatchOutcome, PriceKey,
};
use crate::models::{Order, OrderSide, OrderStatus, OrderType, Trade, TradingPair};
use crate::services::assets::{AssetLedger, LedgerError, TradeSettlement};
use crate::services::events::{
    EngineAlert, EventPublisher, LevelChange, OrderBookDelta, PriceUpdate, TradeExecuted,
    UserOrderUpdate, UserTradeUpdate,
};
use crate::services::fees::FeeSchedule;
use crate::services::history::TradeHistory;
use crate::services::orders::OrderStore;
use crate::services::sequence::IdAllocator;
use crate::services::ticker::TickerService;
use crate::services::writeback::WriteQueue;

/// Engine knobs lifted from configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Account exempt from self-trade prevention.
    pub market_maker_user_id: Option<i64>,
    /// Safety multiplier (>= 0) on the worst-case market-buy notional.
    pub market_buy_collateral_margin: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            market_maker_user_id: None,
            market_buy_collateral_margin: Decimal::ZERO,
        }
    }
}

/// A validated but as-yet-unplaced order.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub user_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub client_order_id: Option<String>,
}

/// Mutable per-symbol state behind the serialisation point.
struct BookState {
    book: OrderBook,
    /// Set on an invariant breach; the symbol then rejects all operations
    /// until an operator intervenes. State is preserved for diagnosis.
    halted: bool,
    /// High-water mark keeping `executed_at` non-decreasing per symbol.
    last_trade_ms: i64,
}

struct SymbolEntry {
    pair: TradingPair,
    state: Mutex<BookState>,
}

/// What one match loop produced.
struct MatchLoopResult {
    trades: Vec<Trade>,
    maker_updates: Vec<Order>,
    touched: Vec<LevelRef>,
}

pub struct MatchingEngine {
    symbols: DashMap<String, Arc<SymbolEntry>>,
    ledger: Arc<AssetLedger>,
    orders: Arc<OrderStore>,
    ids: Arc<IdAllocator>,
    fees: Arc<FeeSchedule>,
    events: Arc<EventPublisher>,
    queue: Arc<WriteQueue>,
    ticker: Arc<TickerService>,
    history: Arc<TradeHistory>,
    config: EngineConfig,
}

impl MatchingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<AssetLedger>,
        orders: Arc<OrderStore>,
        ids: Arc<IdAllocator>,
        fees: Arc<FeeSchedule>,
        events: Arc<EventPublisher>,
        queue: Arc<WriteQueue>,
        ticker: Arc<TickerService>,
        history: Arc<TradeHistory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            symbols: DashMap::new(),
            ledger,
            orders,
            ids,
            fees,
            events,
            queue,
            ticker,
            history,
            config,
        }
    }

    /// Register a trading pair and initialise its (empty) book.
    pub fn register_pair(&self, pair: TradingPair) {
        info!(symbol = %pair.symbol, "registering trading pair");
        self.symbols.insert(
            pair.symbol.clone(),
            Arc::new(SymbolEntry {
                pair,
                state: Mutex::new(BookState {
                    book: OrderBook::new(),
                    halted: false,
                    last_trade_ms: 0,
                }),
            }),
        );
    }

    pub fn pairs(&self) -> Vec<TradingPair> {
        let mut pairs: Vec<TradingPair> = self
            .symbols
            .iter()
            .map(|entry| entry.pair.clone())
            .collect();
        pairs.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        pairs
    }

    pub fn pair(&self, symbol: &str) -> Option<TradingPair> {
        self.symbols.get(symbol).map(|entry| entry.pair.clone())
    }

    fn symbol_entry(&self, symbol: &str) -> Result<Arc<SymbolEntry>, ExchangeError> {
        self.symbols
            .get(symbol)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    // ========================================================================
    // Submission
    // ========================================================================

    pub async fn submit(&self, req: SubmitRequest) -> Result<MatchOutcome, ExchangeError> {
        let entry = self.symbol_entry(&req.symbol)?;
        Self::validate(&entry.pair, &req)?;

        // Serialisation point. Everything below is synchronous.
        let mut state = entry.state.lock().await;
        let pair = &entry.pair;
        if state.halted {
            return Err(ExchangeError::InconsistentState(format!(
                "symbol {} is halted",
                pair.symbol
            )));
        }

        // Collateral freeze.
        let frozen = self.freeze_collateral(pair, &mut state, &req)?;

        // Persist initial state.
        let now = Utc::now();
        let initial_status = match req.order_type {
            OrderType::Limit => OrderStatus::Active,
            OrderType::Market => OrderStatus::Pending,
        };
        let mut taker = Order {
            id: self.ids.next_order_id(),
            user_id: req.user_id,
            trading_pair_id: pair.id,
            symbol: pair.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            price: match req.order_type {
                OrderType::Limit => req.price,
                OrderType::Market => None,
            },
            quantity: req.quantity,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            status: initial_status,
            client_order_id: req.client_order_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.orders.create(taker.clone());
        crate::metrics::record_order_submitted(&req.side.to_string(), &req.order_type.to_string());

        // Match loop.
        let result = self.run_match(pair, &mut state, &mut taker)?;

        // Post-match placement / remainder handling.
        let mut touched = result.touched.clone();
        let remaining = taker.remaining_quantity();
        match taker.order_type {
            OrderType::Limit => {
                if remaining > Decimal::ZERO {
                    let price = self.require_price(&mut state, pair, &taker)?;
                    state.book.insert(
                        taker.side,
                        BookOrder {
                            order_id: taker.id,
                            user_id: taker.user_id,
                            price,
                            remaining,
                            inserted_at: now.timestamp_millis(),
                        },
                    );
                    touched.push(LevelRef {
                        side: taker.side,
                        key: PriceKey::from_decimal(price),
                    });
                }
            }
            OrderType::Market => {
                // Cancel the unfilled remainder and release leftover
                // collateral (partial fills keep the executed quantity).
                let residual = frozen.residual(&result);
                if residual > Decimal::ZERO {
                    if let Err(err) =
                        self.ledger
                            .unfreeze(taker.user_id, &frozen.asset, residual)
                    {
                        return Err(self.halt(pair, &mut state, err.to_string()));
                    }
                }
                if remaining > Decimal::ZERO {
                    taker = self
                        .orders
                        .transition(taker.id, OrderStatus::Cancelled)
                        .map_err(|err| self.halt(pair, &mut state, err.to_string()))?;
                }
            }
        }

        self.publish_outcome(pair, &state, &taker, &result, &touched);

        Ok(MatchOutcome {
            order: taker,
            trades: result.trades,
        })
    }

    /// [`submit`](Self::submit) with an external cancellation window.
    ///
    /// The only await point before state changes is the per-symbol lock, so
    /// a deadline that fires while waiting abandons the operation with zero
    /// side effects and surfaces `Cancelled`. Once the critical section has
    /// started it contains no await points and always runs to completion,
    /// in which case its result is returned even if the deadline has
    /// passed.
    pub async fn submit_with_deadline(
        &self,
        req: SubmitRequest,
        deadline: Duration,
    ) -> Result<MatchOutcome, ExchangeError> {
        match tokio::time::timeout(deadline, self.submit(req)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExchangeError::Cancelled),
        }
    }

    /// [`cancel`](Self::cancel) with an external cancellation window; same
    /// semantics as [`submit_with_deadline`](Self::submit_with_deadline).
    pub async fn cancel_with_deadline(
        &self,
        user_id: i64,
        order_id: i64,
        deadline: Duration,
    ) -> Result<Order, ExchangeError> {
        match tokio::time::timeout(deadline, self.cancel(user_id, order_id)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExchangeError::Cancelled),
        }
    }

    fn validate(pair: &TradingPair, req: &SubmitRequest) -> Result<(), ExchangeError> {
        if !pair.is_active {
            return Err(ExchangeError::Validation(format!(
                "trading pair {} is not active",
                pair.symbol
            )));
        }
        if req.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Validation(
                "quantity must be positive".to_string(),
            ));
        }
        if !pair.quantity_in_bounds(req.quantity) {
            return Err(ExchangeError::Validation(format!(
                "quantity {} outside [{}, {}]",
                req.quantity, pair.min_qty, pair.max_qty
            )));
        }
        if !pair.quantity_precision_ok(req.quantity) {
            return Err(ExchangeError::Validation(format!(
                "quantity {} exceeds {} decimal places",
                req.quantity, pair.qty_precision
            )));
        }
        if req.order_type == OrderType::Limit {
            let price = req.price.ok_or_else(|| {
                ExchangeError::Validation("limit order requires a price".to_string())
            })?;
            if price <= Decimal::ZERO {
                return Err(ExchangeError::Validation(
                    "price must be positive".to_string(),
                ));
            }
            if !pair.price_precision_ok(price) {
                return Err(ExchangeError::Validation(format!(
                    "price {} exceeds {} decimal places",
                    price, pair.price_precision
                )));
            }
        }
        Ok(())
    }

    fn freeze_collateral(
        &self,
        pair: &TradingPair,
        state: &mut BookState,
        req: &SubmitRequest,
    ) -> Result<FrozenCollateral, ExchangeError> {
        let (asset, amount) = match (req.side, req.order_type) {
            (OrderSide::Buy, OrderType::Limit) => {
                // Validation guarantees the price is present.
                let price = req.price.unwrap_or_default();
                (pair.quote_asset.clone(), price * req.quantity)
            }
            (OrderSide::Buy, OrderType::Market) => {
                // Worst-case walk of the live asks, plus the configured
                // safety margin. The walk is exact because it runs under the
                // same serialisation point as the match.
                let (notional, _covered) = state.book.walk_ask_notional(req.quantity);
                let amount = notional * (Decimal::ONE + self.config.market_buy_collateral_margin);
                (pair.quote_asset.clone(), amount)
            }
            (OrderSide::Sell, _) => (pair.base_asset.clone(), req.quantity),
        };

        self.ledger
            .freeze(req.user_id, &asset, amount)
            .map_err(|err| match err {
                LedgerError::InsufficientFunds {
                    needed, available, ..
                } => {
                    crate::metrics::record_order_rejected("insufficient_funds");
                    ExchangeError::InsufficientFunds {
                        symbol: asset.clone(),
                        needed,
                        available,
                    }
                }
                LedgerError::InconsistentState(msg) => ExchangeError::InconsistentState(msg),
            })?;

        Ok(FrozenCollateral {
            asset,
            amount,
            is_quote: req.side == OrderSide::Buy,
        })
    }

    /// The core price-time priority walk. Settles each fill inline and keeps
    /// the book, order store and ledger mutually consistent; any failure in
    /// that path is an invariant breach that halts the symbol.
    fn run_match(
        &self,
        pair: &TradingPair,
        state: &mut BookState,
        taker: &mut Order,
    ) -> Result<MatchLoopResult, ExchangeError> {
        let taker_limit = match taker.order_type {
            OrderType::Limit => taker.price,
            OrderType::Market => None,
        };
        let mut trades = Vec::new();
        let mut maker_updates: Vec<Order> = Vec::new();
        let mut touched = Vec::new();

        let levels = state.book.crossable_levels(taker.side, taker_limit);
        'levels: for key in levels {
            if taker.remaining_quantity() <= Decimal::ZERO {
                break;
            }

            let mut position = 0usize;
            loop {
                if taker.remaining_quantity() <= Decimal::ZERO {
                    break;
                }
                // Inspect the maker at `position` under a short borrow.
                let (maker_id, maker_user, maker_price, maker_remaining) = {
                    let Some(queue) = state.book.opposite_level_mut(taker.side, key) else {
                        break;
                    };
                    let Some(maker) = queue.get(position) else {
                        break;
                    };
                    (
                        maker.order_id,
                        maker.user_id,
                        maker.price,
                        maker.remaining,
                    )
                };

                // Self-trade prevention: skip the maker, preserving its queue
                // position. The designated market maker may self-match.
                if maker_user == taker.user_id
                    && self.config.market_maker_user_id != Some(taker.user_id)
                {
                    position += 1;
                    continue;
                }

                let match_qty = taker.remaining_quantity().min(maker_remaining);
                // Price improvement goes to the taker: trades print at the
                // resting order's price.
                let trade_price = maker_price;
                let quote_qty = match_qty * trade_price;
                let fee = self.fees.fee_for(&pair.symbol, match_qty, trade_price);

                let (buyer, seller, buy_order_id, sell_order_id) = match taker.side {
                    OrderSide::Buy => (taker.user_id, maker_user, taker.id, maker_id),
                    OrderSide::Sell => (maker_user, taker.user_id, maker_id, taker.id),
                };

                if let Err(err) = self.ledger.settle_trade(&TradeSettlement {
                    buyer_user_id: buyer,
                    seller_user_id: seller,
                    base_asset: &pair.base_asset,
                    quote_asset: &pair.quote_asset,
                    base_quantity: match_qty,
                    quote_quantity: quote_qty,
                    fee,
                }) {
                    return Err(self.halt(pair, state, err.to_string()));
                }

                // A limit buy froze at its own limit; when it trades better,
                // the surplus quote goes straight back to available.
                if taker.side == OrderSide::Buy && taker.order_type == OrderType::Limit {
                    let limit_price = taker.price.unwrap_or(trade_price);
                    let surplus = (limit_price - trade_price) * match_qty;
                    if surplus > Decimal::ZERO {
                        if let Err(err) =
                            self.ledger
                                .unfreeze(taker.user_id, &pair.quote_asset, surplus)
                        {
                            return Err(self.halt(pair, state, err.to_string()));
                        }
                    }
                }

                let executed_at = Utc::now().timestamp_millis().max(state.last_trade_ms);
                state.last_trade_ms = executed_at;

                let trade = Trade {
                    id: self.ids.next_trade_id(),
                    trading_pair_id: pair.id,
                    symbol: pair.symbol.clone(),
                    buy_order_id,
                    sell_order_id,
                    buyer_user_id: buyer,
                    seller_user_id: seller,
                    price: trade_price,
                    quantity: match_qty,
                    fee,
                    fee_asset: pair.quote_asset.clone(),
                    executed_at,
                };
                // Enqueued before the serialisation point is released: a
                // published trade is never lost to the write path.
                self.queue.push_trade(trade.clone());
                self.history.record(trade.clone());

                let maker_order = self
                    .orders
                    .apply_fill(maker_id, match_qty, trade_price)
                    .map_err(|err| self.halt(pair, state, err.to_string()))?;
                *taker = self
                    .orders
                    .apply_fill(taker.id, match_qty, trade_price)
                    .map_err(|err| self.halt(pair, state, err.to_string()))?;

                crate::metrics::record_trade_executed(&pair.symbol, quote_qty);
                trades.push(trade);
                maker_updates.push(maker_order);
                touched.push(LevelRef {
                    side: taker.side.opposite(),
                    key,
                });

                // Shrink or consume the maker on the book.
                let maker_left = maker_remaining - match_qty;
                {
                    let Some(queue) = state.book.opposite_level_mut(taker.side, key) else {
                        break;
                    };
                    if maker_left.is_zero() {
                        queue.remove(position);
                    } else if let Some(maker) = queue.get_mut(position) {
                        maker.remaining = maker_left;
                    }
                }
                if maker_left.is_zero() {
                    state.book.drop_index(maker_id);
                    // Same position now holds the next maker in time order.
                } else {
                    // Maker partially filled means the taker is exhausted.
                    debug_assert!(taker.remaining_quantity().is_zero());
                    break 'levels;
                }
            }
            state.book.prune_opposite_level(taker.side, key);
        }

        Ok(MatchLoopResult {
            trades,
            maker_updates,
            touched,
        })
    }

    fn require_price(
        &self,
        state: &mut BookState,
        pair: &TradingPair,
        order: &Order,
    ) -> Result<Decimal, ExchangeError> {
        match order.price {
            Some(price) => Ok(price),
            None => Err(self.halt(
                pair,
                state,
                format!("limit order {} has no price", order.id),
            )),
        }
    }

    /// Escalate an invariant breach: freeze the symbol, alert the operator,
    /// keep state untouched for diagnosis.
    fn halt(&self, pair: &TradingPair, state: &mut BookState, reason: String) -> ExchangeError {
        state.halted = true;
        error!(symbol = %pair.symbol, %reason, "halting symbol on inconsistent state");
        crate::metrics::record_symbol_halt(&pair.symbol);
        self.events.publish_alert(EngineAlert {
            symbol: pair.symbol.clone(),
            message: reason.clone(),
            timestamp: Utc::now().timestamp_millis(),
        });
        ExchangeError::InconsistentState(reason)
    }

    /// Step 6 of the submit flow: one order-update per affected order, one
    /// event per trade, a delta of exactly the changed price levels, and a
    /// ticker update when at least one trade occurred.
    fn publish_outcome(
        &self,
        pair: &TradingPair,
        state: &BookState,
        taker: &Order,
        result: &MatchLoopResult,
        touched: &[LevelRef],
    ) {
        // Latest state per maker wins when one maker filled repeatedly.
        let mut makers: Vec<&Order> = Vec::new();
        for update in &result.maker_updates {
            makers.retain(|m| m.id != update.id);
            makers.push(update);
        }
        for maker in makers {
            self.events.publish_user_order(UserOrderUpdate {
                user_id: maker.user_id,
                order: maker.into(),
            });
        }
        self.events.publish_user_order(UserOrderUpdate {
            user_id: taker.user_id,
            order: taker.into(),
        });

        for trade in &result.trades {
            self.events.publish_trade(TradeExecuted {
                trade: trade.clone(),
                taker_side: taker.side,
            });
            for user_id in [trade.buyer_user_id, trade.seller_user_id] {
                self.events.publish_user_trade(UserTradeUpdate {
                    user_id,
                    trade: crate::models::UserTradeView::for_user(trade, user_id),
                });
            }
        }

        let changes: Vec<LevelChange> = state
            .book
            .levels_at(touched.iter().map(|level| (level.side, level.key)))
            .into_iter()
            .map(|(side, price, quantity)| LevelChange {
                side,
                price,
                quantity,
            })
            .collect();
        if !changes.is_empty() {
            self.events.publish_book_delta(OrderBookDelta {
                symbol: pair.symbol.clone(),
                changes,
                timestamp: Utc::now().timestamp_millis(),
            });
        }

        if let Some(last) = result.trades.last() {
            let mut stats = None;
            for trade in &result.trades {
                stats = Some(self.ticker.record_trade(
                    &pair.symbol,
                    trade.price,
                    trade.quantity,
                    trade.executed_at,
                ));
            }
            let Some(stats) = stats else {
                return;
            };
            self.events.publish_price(PriceUpdate {
                symbol: pair.symbol.clone(),
                last_price: last.price,
                last_quantity: last.quantity,
                change_24h: stats.change_24h,
                change_percent_24h: stats.change_percent_24h,
                high_24h: stats.high_24h,
                low_24h: stats.low_24h,
                volume_24h: stats.volume_24h,
                mid_price: state.book.mid_price(),
                timestamp: last.executed_at,
            });
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    pub async fn cancel(&self, user_id: i64, order_id: i64) -> Result<Order, ExchangeError> {
        let order = self
            .orders
            .get(order_id)
            .ok_or(ExchangeError::NotFound(order_id))?;
        if order.user_id != user_id {
            return Err(ExchangeError::NotOwner { order_id, user_id });
        }

        let entry = self.symbol_entry(&order.symbol)?;
        let mut state = entry.state.lock().await;
        let pair = &entry.pair;
        if state.halted {
            return Err(ExchangeError::InconsistentState(format!(
                "symbol {} is halted",
                pair.symbol
            )));
        }

        // Re-read under the lock: a fill may have raced this cancel in, and
        // exactly one of Cancelled or Filled must win.
        let order = self
            .orders
            .get(order_id)
            .ok_or(ExchangeError::NotFound(order_id))?;
        if order.status.is_terminal() {
            return Err(ExchangeError::InvalidStateTransition(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }

        let removed = state.book.remove(order_id);

        let remaining = order.remaining_quantity();
        let unfreeze_result = match order.side {
            OrderSide::Buy => match order.price {
                Some(price) => {
                    self.ledger
                        .unfreeze(order.user_id, &pair.quote_asset, remaining * price)
                }
                None => Ok(()),
            },
            OrderSide::Sell => self
                .ledger
                .unfreeze(order.user_id, &pair.base_asset, remaining),
        };
        if let Err(err) = unfreeze_result {
            return Err(self.halt(pair, &mut state, err.to_string()));
        }

        let cancelled = self
            .orders
            .transition(order_id, OrderStatus::Cancelled)
            .map_err(|err| ExchangeError::InvalidStateTransition(err.to_string()))?;
        crate::metrics::record_order_cancelled();

        self.events.publish_user_order(UserOrderUpdate {
            user_id: cancelled.user_id,
            order: (&cancelled).into(),
        });
        if let Some((side, book_order)) = removed {
            let key = PriceKey::from_decimal(book_order.price);
            self.events.publish_book_delta(OrderBookDelta {
                symbol: pair.symbol.clone(),
                changes: vec![LevelChange {
                    side,
                    price: book_order.price,
                    quantity: state.book.level_quantity(side, key),
                }],
                timestamp: Utc::now().timestamp_millis(),
            });
        }

        Ok(cancelled)
    }

    /// Cancel every open order of a user, optionally scoped to one symbol.
    /// Each cancellation funnels through the normal path so it takes the
    /// same lock and emits the same events.
    pub async fn cancel_all(&self, user_id: i64, symbol: Option<&str>) -> CancelAllOutcome {
        let open = self.orders.list_open(Some(user_id), symbol);
        let mut outcome = CancelAllOutcome {
            success_count: 0,
            failed_count: 0,
            cancelled_ids: Vec::new(),
        };
        for order in open {
            match self.cancel(user_id, order.id).await {
                Ok(cancelled) => {
                    outcome.success_count += 1;
                    outcome.cancelled_ids.push(cancelled.id);
                }
                Err(err) => {
                    warn!(order_id = order.id, %err, "cancel-all: order skipped");
                    outcome.failed_count += 1;
                }
            }
        }
        outcome
    }

    // ========================================================================
    // Reads & recovery
    // ========================================================================

    /// Top-N depth. Enters the serialisation point for snapshot consistency.
    pub async fn depth(&self, symbol: &str, n: usize) -> Result<DepthSnapshot, ExchangeError> {
        let entry = self.symbol_entry(symbol)?;
        let state = entry.state.lock().await;
        let (bids, asks) = state.book.depth_snapshot(n);
        Ok(DepthSnapshot {
            symbol: symbol.to_string(),
            bids,
            asks,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    pub async fn mid_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        let entry = self.symbol_entry(symbol)?;
        let state = entry.state.lock().await;
        Ok(state.book.mid_price())
    }

    /// Test hook: occupy the symbol's serialisation point, acknowledging
    /// acquisition, until `release` fires.
    #[cfg(test)]
    pub(crate) async fn occupy_symbol(
        &self,
        symbol: &str,
        acquired: tokio::sync::oneshot::Sender<()>,
        release: tokio::sync::oneshot::Receiver<()>,
    ) {
        let entry = self.symbol_entry(symbol).expect("unknown symbol");
        let _guard = entry.state.lock().await;
        let _ = acquired.send(());
        let _ = release.await;
    }

    /// Re-insert a recovered open limit order at its original time priority.
    pub async fn insert_recovered(&self, order: &Order) -> Result<(), ExchangeError> {
        if order.order_type != OrderType::Limit || !order.is_open() {
            return Ok(());
        }
        let price = order.price.ok_or_else(|| {
            ExchangeError::InconsistentState(format!("recovered limit order {} has no price", order.id))
        })?;
        let entry = self.symbol_entry(&order.symbol)?;
        let mut state = entry.state.lock().await;
        state.book.insert(
            order.side,
            BookOrder {
                order_id: order.id,
                user_id: order.user_id,
                price,
                remaining: order.remaining_quantity(),
                inserted_at: order.created_at.timestamp_millis(),
            },
        );
        Ok(())
    }
}

/// Collateral frozen for one submission, with enough context to release the
/// unused remainder.
struct FrozenCollateral {
    asset: String,
    amount: Decimal,
    is_quote: bool,
}

impl FrozenCollateral {
    /// Collateral left over once the match loop is done. For buys that is
    /// the frozen notional minus quote actually spent; for sells, the base
    /// quantity not consumed is released by the caller via remaining qty —
    /// market sells freeze exactly `quantity`, so the unspent part is the
    /// remainder itself.
    fn residual(&self, result: &MatchLoopResult) -> Decimal {
        if self.is_quote {
            let spent: Decimal = result
                .trades
                .iter()
                .map(|t| t.quantity * t.price)
                .sum();
            self.amount - spent
        } else {
            let sold: Decimal = result.trades.iter().map(|t| t.quantity).sum();
            self.amount - sold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct TestExchange {
        engine: MatchingEngine,
        ledger: Arc<AssetLedger>,
        orders: Arc<OrderStore>,
        events: Arc<EventPublisher>,
        queue: Arc<WriteQueue>,
    }

    fn btcusdt_pair() -> TradingPair {
        TradingPair {
            id: 1,
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            min_qty: dec!(0.0001),
            max_qty: dec!(1000),
            price_precision: 2,
            qty_precision: 4,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn exchange_with(config: EngineConfig, fee_rate: Decimal) -> TestExchange {
        let queue = Arc::new(WriteQueue::new(10_000));
        let events = Arc::new(EventPublisher::new(256));
        let ledger = Arc::new(AssetLedger::new(Arc::clone(&queue), Arc::clone(&events)));
        let orders = Arc::new(OrderStore::new(Arc::clone(&queue)));
        let engine = MatchingEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&orders),
            Arc::new(IdAllocator::new()),
            Arc::new(FeeSchedule::new(fee_rate)),
            Arc::clone(&events),
            Arc::clone(&queue),
            Arc::new(TickerService::new()),
            Arc::new(TradeHistory::new(10_000)),
            config,
        );
        engine.register_pair(btcusdt_pair());
        TestExchange {
            engine,
            ledger,
            orders,
            events,
            queue,
        }
    }

    fn exchange() -> TestExchange {
        exchange_with(EngineConfig::default(), Decimal::ZERO)
    }

    fn limit(user_id: i64, side: OrderSide, qty: Decimal, price: Decimal) -> SubmitRequest {
        SubmitRequest {
            user_id,
            symbol: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Limit,
            quantity: qty,
            price: Some(price),
            client_order_id: None,
        }
    }

    fn market(user_id: i64, side: OrderSide, qty: Decimal) -> SubmitRequest {
        SubmitRequest {
            user_id,
            symbol: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Market,
            quantity: qty,
            price: None,
            client_order_id: None,
        }
    }

    fn assert_balance(ex: &TestExchange, user: i64, symbol: &str, available: Decimal, frozen: Decimal) {
        let view = ex
            .ledger
            .get(user, symbol)
            .unwrap_or_else(|| panic!("no {} record for user {}", symbol, user));
        assert_eq!(view.available, available, "{} available for user {}", symbol, user);
        assert_eq!(view.frozen, frozen, "{} frozen for user {}", symbol, user);
    }

    // ------------------------------------------------------------------
    // End-to-end scenarios
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_simple_cross() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        let sell = ex
            .engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        assert_eq!(sell.order.status, OrderStatus::Active);
        assert!(sell.trades.is_empty());

        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].price, dec!(50000));
        assert_eq!(buy.trades[0].quantity, dec!(0.01));
        assert_eq!(buy.order.status, OrderStatus::Filled);
        assert_eq!(
            ex.orders.get(sell.order.id).unwrap().status,
            OrderStatus::Filled
        );

        assert_balance(&ex, 1, "BTC", dec!(0.01), dec!(0));
        assert_balance(&ex, 1, "USDT", dec!(500), dec!(0));
        assert_balance(&ex, 2, "BTC", dec!(0), dec!(0));
        assert_balance(&ex, 2, "USDT", dec!(500), dec!(0));
    }

    #[tokio::test]
    async fn test_partial_fill_rests_remainder() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.02)).unwrap();

        let sell = ex
            .engine
            .submit(limit(2, OrderSide::Sell, dec!(0.02), dec!(50000)))
            .await
            .unwrap();
        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].quantity, dec!(0.01));
        assert_eq!(buy.order.status, OrderStatus::Filled);

        let maker = ex.orders.get(sell.order.id).unwrap();
        assert_eq!(maker.status, OrderStatus::PartiallyFilled);
        assert_eq!(maker.remaining_quantity(), dec!(0.01));

        // Remainder still on the book at the same price.
        let depth = ex.engine.depth("BTCUSDT", 10).await.unwrap();
        assert_eq!(depth.asks, vec![(dec!(50000), dec!(0.01))]);

        assert_balance(&ex, 1, "BTC", dec!(0.01), dec!(0));
        assert_balance(&ex, 1, "USDT", dec!(500), dec!(0));
        assert_balance(&ex, 2, "BTC", dec!(0), dec!(0.01));
        assert_balance(&ex, 2, "USDT", dec!(500), dec!(0));
    }

    #[tokio::test]
    async fn test_self_trade_prevention() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(1, "BTC", dec!(0.01)).unwrap();

        let sell = ex
            .engine
            .submit(limit(1, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        assert!(buy.trades.is_empty());
        assert_eq!(buy.order.status, OrderStatus::Active);
        assert_eq!(ex.orders.get(sell.order.id).unwrap().status, OrderStatus::Active);

        // Both rest on opposite sides.
        let depth = ex.engine.depth("BTCUSDT", 10).await.unwrap();
        assert_eq!(depth.bids, vec![(dec!(50000), dec!(0.01))]);
        assert_eq!(depth.asks, vec![(dec!(50000), dec!(0.01))]);
    }

    #[tokio::test]
    async fn test_market_buy_partial_then_cancel() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.007)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.005), dec!(50000)))
            .await
            .unwrap();
        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.002), dec!(51000)))
            .await
            .unwrap();

        let outcome = ex
            .engine
            .submit(market(1, OrderSide::Buy, dec!(0.01)))
            .await
            .unwrap();

        assert_eq!(outcome.trades.len(), 2);
        assert_eq!(outcome.trades[0].price, dec!(50000));
        assert_eq!(outcome.trades[0].quantity, dec!(0.005));
        assert_eq!(outcome.trades[1].price, dec!(51000));
        assert_eq!(outcome.trades[1].quantity, dec!(0.002));

        // Remainder cancelled, executed quantity kept.
        assert_eq!(outcome.order.status, OrderStatus::Cancelled);
        assert_eq!(outcome.order.filled_quantity, dec!(0.007));

        // 1000 - 0.005*50000 - 0.002*51000 = 648
        assert_balance(&ex, 1, "BTC", dec!(0.007), dec!(0));
        assert_balance(&ex, 1, "USDT", dec!(648), dec!(0));
    }

    #[tokio::test]
    async fn test_cancel_frees_funds() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();

        let outcome = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        assert_balance(&ex, 1, "USDT", dec!(500), dec!(500));

        let cancelled = ex.engine.cancel(1, outcome.order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_balance(&ex, 1, "USDT", dec!(1000), dec!(0));

        let depth = ex.engine.depth("BTCUSDT", 10).await.unwrap();
        assert!(depth.bids.is_empty());
    }

    #[tokio::test]
    async fn test_restart_preserves_book_and_priority() {
        // Run the partial-fill scenario, then rebuild a fresh engine from
        // the surviving order/asset state the way the recovery loader does.
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.02)).unwrap();

        let sell = ex
            .engine
            .submit(limit(2, OrderSide::Sell, dec!(0.02), dec!(50000)))
            .await
            .unwrap();
        ex.engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        let survivor = ex.orders.get(sell.order.id).unwrap();

        let ex2 = exchange();
        for user in [1, 2] {
            for view in ex.ledger.list_by_user(user) {
                ex2.ledger.load_recovered(&crate::models::Asset {
                    user_id: view.user_id,
                    symbol: view.symbol.clone(),
                    available: view.available,
                    frozen: view.frozen,
                    updated_at: Utc::now(),
                });
            }
        }
        ex2.orders.load_recovered(survivor.clone());
        ex2.engine.insert_recovered(&survivor).await.unwrap();

        // Same price level, original remaining quantity.
        let depth = ex2.engine.depth("BTCUSDT", 10).await.unwrap();
        assert_eq!(depth.asks, vec![(dec!(50000), dec!(0.01))]);

        // A post-restart ask at the same price queues behind the survivor.
        ex2.ledger.credit(3, "BTC", dec!(0.01)).unwrap();
        ex2.engine
            .submit(limit(3, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        ex2.ledger.credit(4, "USDT", dec!(500)).unwrap();
        let buy = ex2
            .engine
            .submit(limit(4, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].sell_order_id, survivor.id);
    }

    // ------------------------------------------------------------------
    // Validation & rejection
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_min_qty_boundary() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();

        // Exactly min_qty succeeds.
        ex.engine
            .submit(limit(1, OrderSide::Buy, dec!(0.0001), dec!(50000)))
            .await
            .unwrap();

        // Below min_qty rejects as validation.
        let err = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.00009), dec!(50000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_qty_precision_rejected() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        let err = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.00015), dec!(50000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_limit_requires_price() {
        let ex = exchange();
        let mut req = limit(1, OrderSide::Buy, dec!(0.01), dec!(50000));
        req.price = None;
        let err = ex.engine.submit(req).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let ex = exchange();
        let mut req = limit(1, OrderSide::Buy, dec!(0.01), dec!(50000));
        req.symbol = "DOGEUSDT".to_string();
        let err = ex.engine.submit(req).await.unwrap_err();
        assert!(matches!(err, ExchangeError::UnknownSymbol(_)));
    }

    #[tokio::test]
    async fn test_inactive_pair_rejected() {
        let ex = exchange();
        let mut pair = btcusdt_pair();
        pair.symbol = "ETHUSDT".to_string();
        pair.base_asset = "ETH".to_string();
        pair.is_active = false;
        ex.engine.register_pair(pair);

        let mut req = limit(1, OrderSide::Buy, dec!(0.01), dec!(50000));
        req.symbol = "ETHUSDT".to_string();
        let err = ex.engine.submit(req).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_insufficient_funds_rejects_without_state() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(499)).unwrap();

        let err = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds { .. }));

        // No order stored, nothing frozen, nothing on the book.
        assert_eq!(ex.orders.len(), 0);
        assert_balance(&ex, 1, "USDT", dec!(499), dec!(0));
        let depth = ex.engine.depth("BTCUSDT", 10).await.unwrap();
        assert!(depth.bids.is_empty());
    }

    #[tokio::test]
    async fn test_market_buy_empty_book_cancels_with_zero_fills() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();

        let outcome = ex
            .engine
            .submit(market(1, OrderSide::Buy, dec!(0.01)))
            .await
            .unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Cancelled);
        assert_eq!(outcome.order.filled_quantity, dec!(0));
        assert!(outcome.trades.is_empty());
        assert_balance(&ex, 1, "USDT", dec!(1000), dec!(0));
    }

    // ------------------------------------------------------------------
    // Matching semantics
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_price_improvement_goes_to_taker() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        // Taker bids 51000, but the trade prints at the maker's 50000.
        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(51000)))
            .await
            .unwrap();

        assert_eq!(buy.trades[0].price, dec!(50000));
        // Surplus collateral from the improvement is released.
        assert_balance(&ex, 1, "USDT", dec!(500), dec!(0));
        assert_balance(&ex, 2, "USDT", dec!(500), dec!(0));
    }

    #[tokio::test]
    async fn test_price_time_priority() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(10000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(1)).unwrap();
        ex.ledger.credit(3, "BTC", dec!(1)).unwrap();
        ex.ledger.credit(4, "BTC", dec!(1)).unwrap();

        // Better price first, then earlier arrival at the same price.
        let worse = ex
            .engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50100)))
            .await
            .unwrap();
        let early = ex
            .engine
            .submit(limit(3, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        let late = ex
            .engine
            .submit(limit(4, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.03), dec!(50100)))
            .await
            .unwrap();

        let sellers: Vec<i64> = buy.trades.iter().map(|t| t.sell_order_id).collect();
        assert_eq!(sellers, vec![early.order.id, late.order.id, worse.order.id]);
    }

    #[tokio::test]
    async fn test_self_trade_skip_preserves_time_priority() {
        let ex = exchange();
        ex.ledger.credit(1, "BTC", dec!(1)).unwrap();
        ex.ledger.credit(1, "USDT", dec!(10000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(1)).unwrap();
        ex.ledger.credit(3, "USDT", dec!(10000)).unwrap();

        // User 1's own ask is first in the queue, user 2's behind it.
        let own = ex
            .engine
            .submit(limit(1, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        let other = ex
            .engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        // User 1 buying skips their own maker, trades with user 2's.
        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.trades[0].sell_order_id, other.order.id);

        // The skipped maker kept its front-of-queue priority.
        let buy2 = ex
            .engine
            .submit(limit(3, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        assert_eq!(buy2.trades[0].sell_order_id, own.order.id);
    }

    #[tokio::test]
    async fn test_market_maker_may_self_match() {
        let ex = exchange_with(
            EngineConfig {
                market_maker_user_id: Some(9),
                market_buy_collateral_margin: Decimal::ZERO,
            },
            Decimal::ZERO,
        );
        ex.ledger.credit(9, "BTC", dec!(0.01)).unwrap();
        ex.ledger.credit(9, "USDT", dec!(1000)).unwrap();

        ex.engine
            .submit(limit(9, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        let buy = ex
            .engine
            .submit(limit(9, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.order.status, OrderStatus::Filled);
        // Self-trade nets out to the starting balances.
        assert_balance(&ex, 9, "BTC", dec!(0.01), dec!(0));
        assert_balance(&ex, 9, "USDT", dec!(1000), dec!(0));
    }

    #[tokio::test]
    async fn test_fee_deducted_from_seller_quote() {
        let ex = exchange_with(EngineConfig::default(), dec!(0.001));
        ex.ledger.credit(1, "USDT", dec!(500)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        // fee = 0.01 * 50000 * 0.001 = 0.5, in USDT, off the seller's credit
        assert_eq!(buy.trades[0].fee, dec!(0.5));
        assert_eq!(buy.trades[0].fee_asset, "USDT");
        assert_balance(&ex, 2, "USDT", dec!(499.5), dec!(0));
        assert_balance(&ex, 1, "BTC", dec!(0.01), dec!(0));
    }

    #[tokio::test]
    async fn test_trade_ids_and_timestamps_monotonic() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(10000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(1)).unwrap();

        for _ in 0..3 {
            ex.engine
                .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
                .await
                .unwrap();
        }
        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.03), dec!(50000)))
            .await
            .unwrap();

        assert_eq!(buy.trades.len(), 3);
        for pair in buy.trades.windows(2) {
            assert!(pair[1].id > pair[0].id);
            assert!(pair[1].executed_at >= pair[0].executed_at);
        }
    }

    #[tokio::test]
    async fn test_average_fill_price_across_levels() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(10000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(1)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(51000)))
            .await
            .unwrap();

        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.02), dec!(51000)))
            .await
            .unwrap();
        assert_eq!(buy.order.average_fill_price, Some(dec!(50500)));
    }

    // ------------------------------------------------------------------
    // Cancellation paths
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_unknown_and_foreign_orders() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();

        assert!(matches!(
            ex.engine.cancel(1, 404).await.unwrap_err(),
            ExchangeError::NotFound(404)
        ));

        let outcome = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        assert!(matches!(
            ex.engine.cancel(2, outcome.order.id).await.unwrap_err(),
            ExchangeError::NotOwner { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_terminal_order_rejected() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        assert_eq!(buy.order.status, OrderStatus::Filled);

        let err = ex.engine.cancel(1, buy.order.id).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidStateTransition(_)));
    }

    #[tokio::test]
    async fn test_cancel_partially_filled_releases_remainder_only() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.02), dec!(50000)))
            .await
            .unwrap();
        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        // Half filled: 500 spent, 500 still frozen for the open half.
        assert_balance(&ex, 1, "USDT", dec!(0), dec!(500));

        ex.engine.cancel(1, buy.order.id).await.unwrap();
        assert_balance(&ex, 1, "USDT", dec!(500), dec!(0));
        let order = ex.orders.get(buy.order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.filled_quantity, dec!(0.01));
    }

    #[tokio::test]
    async fn test_cancel_all_scoped_by_symbol() {
        let ex = exchange();
        let mut eth = btcusdt_pair();
        eth.id = 2;
        eth.symbol = "ETHUSDT".to_string();
        eth.base_asset = "ETH".to_string();
        ex.engine.register_pair(eth);

        ex.ledger.credit(1, "USDT", dec!(10000)).unwrap();
        ex.engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        ex.engine
            .submit(limit(1, OrderSide::Buy, dec!(0.02), dec!(49000)))
            .await
            .unwrap();
        let mut eth_req = limit(1, OrderSide::Buy, dec!(0.01), dec!(3000));
        eth_req.symbol = "ETHUSDT".to_string();
        ex.engine.submit(eth_req).await.unwrap();

        let outcome = ex.engine.cancel_all(1, Some("BTCUSDT")).await;
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.failed_count, 0);
        assert_eq!(outcome.cancelled_ids.len(), 2);

        // The ETH order survives.
        assert_eq!(ex.orders.list_open(Some(1), None).len(), 1);

        let outcome = ex.engine.cancel_all(1, None).await;
        assert_eq!(outcome.success_count, 1);
        assert!(ex.orders.list_open(Some(1), None).is_empty());
    }

    // ------------------------------------------------------------------
    // Events & write intents
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_events_published_on_cross() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        let mut trade_rx = ex.events.subscribe_trades();
        let mut order_rx = ex.events.subscribe_user_orders();
        let mut delta_rx = ex.events.subscribe_book_deltas();
        let mut price_rx = ex.events.subscribe_prices();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        ex.engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        let trade = trade_rx.recv().await.unwrap();
        assert_eq!(trade.trade.price, dec!(50000));
        assert_eq!(trade.taker_side, OrderSide::Buy);

        // First submit published the resting seller's order update.
        let first = order_rx.recv().await.unwrap();
        assert_eq!(first.user_id, 2);
        assert_eq!(first.order.status, OrderStatus::Active);

        // The cross publishes maker then taker updates.
        let maker = order_rx.recv().await.unwrap();
        assert_eq!(maker.user_id, 2);
        assert_eq!(maker.order.status, OrderStatus::Filled);
        let taker = order_rx.recv().await.unwrap();
        assert_eq!(taker.user_id, 1);
        assert_eq!(taker.order.status, OrderStatus::Filled);

        // Delta from the first submit: the new ask level.
        let resting = delta_rx.recv().await.unwrap();
        assert_eq!(resting.changes.len(), 1);
        assert_eq!(resting.changes[0].quantity, dec!(0.01));
        // Delta from the cross: the consumed level reports zero.
        let consumed = delta_rx.recv().await.unwrap();
        assert_eq!(consumed.changes[0].side, OrderSide::Sell);
        assert_eq!(consumed.changes[0].price, dec!(50000));
        assert_eq!(consumed.changes[0].quantity, dec!(0));

        let price = price_rx.recv().await.unwrap();
        assert_eq!(price.last_price, dec!(50000));
        assert_eq!(price.volume_24h, dec!(0.01));
    }

    #[tokio::test]
    async fn test_trade_intent_enqueued_before_submit_returns() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        ex.engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        assert_eq!(ex.queue.pending_trades(), 1);
        // Both orders plus every balance touch left write intents.
        assert!(ex.queue.pending_orders() > 0);
        assert!(ex.queue.pending_assets() > 0);
    }

    // ------------------------------------------------------------------
    // External cancellation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_submit_cancelled_before_lock_has_no_side_effects() {
        let ex = Arc::new(exchange());
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        let orders_pending = ex.queue.pending_orders();
        let assets_pending = ex.queue.pending_assets();

        // Another task occupies the symbol's serialisation point.
        let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let holder = {
            let ex = Arc::clone(&ex);
            tokio::spawn(async move {
                ex.engine
                    .occupy_symbol("BTCUSDT", acquired_tx, release_rx)
                    .await;
            })
        };
        acquired_rx.await.unwrap();

        // The deadline fires while waiting for the lock: the operation is
        // abandoned as Cancelled with zero side effects.
        let err = ex
            .engine
            .submit_with_deadline(
                limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Cancelled));

        assert_eq!(ex.orders.len(), 0);
        assert_eq!(ex.queue.pending_orders(), orders_pending);
        assert_eq!(ex.queue.pending_assets(), assets_pending);
        assert_balance(&ex, 1, "USDT", dec!(1000), dec!(0));

        release_tx.send(()).unwrap();
        holder.await.unwrap();

        // The same submission goes through once the lock frees.
        let outcome = ex
            .engine
            .submit_with_deadline(
                limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Active);
        assert_balance(&ex, 1, "USDT", dec!(500), dec!(500));
    }

    #[tokio::test]
    async fn test_cancel_cancelled_before_lock_leaves_order_untouched() {
        let ex = Arc::new(exchange());
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        let resting = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let holder = {
            let ex = Arc::clone(&ex);
            tokio::spawn(async move {
                ex.engine
                    .occupy_symbol("BTCUSDT", acquired_tx, release_rx)
                    .await;
            })
        };
        acquired_rx.await.unwrap();

        let err = ex
            .engine
            .cancel_with_deadline(1, resting.order.id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Cancelled));

        // Still open, still frozen.
        let order = ex.orders.get(resting.order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Active);
        assert_balance(&ex, 1, "USDT", dec!(500), dec!(500));

        release_tx.send(()).unwrap();
        holder.await.unwrap();

        let cancelled = ex
            .engine
            .cancel_with_deadline(1, resting.order.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_balance(&ex, 1, "USDT", dec!(1000), dec!(0));
    }

    // ------------------------------------------------------------------
    // Halt semantics
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_unbacked_maker_halts_symbol() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();

        // Fabricate a resting ask with no frozen base behind it, as a
        // corrupted recovery would.
        let ghost = Order {
            id: 999,
            user_id: 2,
            trading_pair_id: 1,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            price: Some(dec!(50000)),
            quantity: dec!(0.01),
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            status: OrderStatus::Active,
            client_order_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        ex.orders.load_recovered(ghost.clone());
        ex.engine.insert_recovered(&ghost).await.unwrap();

        let mut alert_rx = ex.events.subscribe_alerts();

        let err = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InconsistentState(_)));

        let alert = alert_rx.recv().await.unwrap();
        assert_eq!(alert.symbol, "BTCUSDT");

        // The symbol now rejects everything until operator intervention.
        let err = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(49000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InconsistentState(_)));
    }

    #[tokio::test]
    async fn test_partial_cross_rests_taker_remainder() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(10000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        let buy = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.03), dec!(50000)))
            .await
            .unwrap();

        // One fill, remainder resting on the bid side.
        assert_eq!(buy.trades.len(), 1);
        assert_eq!(buy.order.status, OrderStatus::PartiallyFilled);
        assert_eq!(buy.order.remaining_quantity(), dec!(0.02));

        let depth = ex.engine.depth("BTCUSDT", 10).await.unwrap();
        assert_eq!(depth.bids, vec![(dec!(50000), dec!(0.02))]);
        assert!(depth.asks.is_empty());

        // 1500 frozen, 500 spent on the fill, 1000 still backing the rest.
        assert_balance(&ex, 1, "USDT", dec!(8500), dec!(1000));
    }

    #[tokio::test]
    async fn test_cancel_publishes_order_and_delta() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();

        let outcome = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        let mut order_rx = ex.events.subscribe_user_orders();
        let mut delta_rx = ex.events.subscribe_book_deltas();

        ex.engine.cancel(1, outcome.order.id).await.unwrap();

        let update = order_rx.recv().await.unwrap();
        assert_eq!(update.order.status, OrderStatus::Cancelled);

        let delta = delta_rx.recv().await.unwrap();
        assert_eq!(delta.changes.len(), 1);
        assert_eq!(delta.changes[0].side, OrderSide::Buy);
        assert_eq!(delta.changes[0].quantity, dec!(0));
    }

    #[tokio::test]
    async fn test_market_sell_partial_then_cancel() {
        let ex = exchange();
        ex.ledger.credit(1, "BTC", dec!(0.02)).unwrap();
        ex.ledger.credit(2, "USDT", dec!(1000)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Buy, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        let outcome = ex
            .engine
            .submit(market(1, OrderSide::Sell, dec!(0.02)))
            .await
            .unwrap();

        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.trades[0].quantity, dec!(0.01));
        assert_eq!(outcome.order.status, OrderStatus::Cancelled);
        assert_eq!(outcome.order.filled_quantity, dec!(0.01));

        // The unsold half of the base collateral came back.
        assert_balance(&ex, 1, "BTC", dec!(0.01), dec!(0));
        assert_balance(&ex, 1, "USDT", dec!(500), dec!(0));
    }

    #[tokio::test]
    async fn test_max_qty_and_price_precision_bounds() {
        let ex = exchange();
        ex.ledger.credit(1, "BTC", dec!(2000)).unwrap();

        let err = ex
            .engine
            .submit(limit(1, OrderSide::Sell, dec!(1000.0001), dec!(50000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));

        // Price carries 3 fractional digits against price_precision 2.
        let err = ex
            .engine
            .submit(limit(1, OrderSide::Sell, dec!(1), dec!(50000.123)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));

        let err = ex
            .engine
            .submit(limit(1, OrderSide::Sell, dec!(0), dec!(50000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));

        let err = ex
            .engine
            .submit(limit(1, OrderSide::Sell, dec!(1), dec!(-1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_market_buy_margin_released_on_completion() {
        let ex = exchange_with(
            EngineConfig {
                market_maker_user_id: None,
                market_buy_collateral_margin: dec!(0.05),
            },
            Decimal::ZERO,
        );
        ex.ledger.credit(1, "USDT", dec!(1000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();
        let outcome = ex
            .engine
            .submit(market(1, OrderSide::Buy, dec!(0.01)))
            .await
            .unwrap();

        assert_eq!(outcome.order.status, OrderStatus::Filled);
        // Freeze was 500 * 1.05 = 525; only 500 was spent.
        assert_balance(&ex, 1, "USDT", dec!(500), dec!(0));
        assert_balance(&ex, 1, "BTC", dec!(0.01), dec!(0));
    }

    #[tokio::test]
    async fn test_market_buy_insufficient_for_walk_rejects() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(100)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(0.01)).unwrap();

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.01), dec!(50000)))
            .await
            .unwrap();

        let err = ex
            .engine
            .submit(market(1, OrderSide::Buy, dec!(0.01)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds { .. }));
        assert_balance(&ex, 1, "USDT", dec!(100), dec!(0));
    }

    #[tokio::test]
    async fn test_symbols_run_independently() {
        let ex = Arc::new(exchange());
        let mut eth = btcusdt_pair();
        eth.id = 2;
        eth.symbol = "ETHUSDT".to_string();
        eth.base_asset = "ETH".to_string();
        ex.engine.register_pair(eth);

        for user in 1..=4 {
            ex.ledger.credit(user, "USDT", dec!(100000)).unwrap();
            ex.ledger.credit(user, "BTC", dec!(10)).unwrap();
            ex.ledger.credit(user, "ETH", dec!(100)).unwrap();
        }

        let mut handles = Vec::new();
        for (user, symbol, side) in [
            (1, "BTCUSDT", OrderSide::Sell),
            (2, "BTCUSDT", OrderSide::Buy),
            (3, "ETHUSDT", OrderSide::Sell),
            (4, "ETHUSDT", OrderSide::Buy),
        ] {
            let ex = Arc::clone(&ex);
            let symbol = symbol.to_string();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let mut req = limit(user, side, dec!(0.01), dec!(1000));
                    req.symbol = symbol.clone();
                    ex.engine.submit(req).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every submission either rested or crossed; nothing was lost and
        // nothing leaked across books.
        assert_eq!(ex.ledger.total_supply("BTC"), dec!(40));
        assert_eq!(ex.ledger.total_supply("ETH"), dec!(400));
        assert_eq!(ex.ledger.total_supply("USDT"), dec!(400000));
        for symbol in ["BTCUSDT", "ETHUSDT"] {
            let depth = ex.engine.depth(symbol, 100).await.unwrap();
            for (_, qty) in depth.bids.iter().chain(depth.asks.iter()) {
                assert!(*qty > dec!(0));
            }
        }
    }

    // ------------------------------------------------------------------
    // Conservation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_balance_conservation_through_mixed_flow() {
        let ex = exchange();
        ex.ledger.credit(1, "USDT", dec!(10000)).unwrap();
        ex.ledger.credit(2, "USDT", dec!(5000)).unwrap();
        ex.ledger.credit(2, "BTC", dec!(1)).unwrap();
        ex.ledger.credit(3, "BTC", dec!(2)).unwrap();

        let usdt = ex.ledger.total_supply("USDT");
        let btc = ex.ledger.total_supply("BTC");

        ex.engine
            .submit(limit(2, OrderSide::Sell, dec!(0.5), dec!(50000)))
            .await
            .unwrap();
        ex.engine
            .submit(limit(3, OrderSide::Sell, dec!(0.3), dec!(50100)))
            .await
            .unwrap();
        ex.engine
            .submit(limit(1, OrderSide::Buy, dec!(0.1), dec!(50100)))
            .await
            .unwrap();
        let big = ex
            .engine
            .submit(limit(1, OrderSide::Buy, dec!(0.05), dec!(49000)))
            .await
            .unwrap();
        ex.engine.cancel(1, big.order.id).await.unwrap();
        ex.engine
            .submit(market(2, OrderSide::Buy, dec!(0.2)))
            .await
            .unwrap();

        assert_eq!(ex.ledger.total_supply("USDT"), usdt);
        assert_eq!(ex.ledger.total_supply("BTC"), btc);
    }
}
