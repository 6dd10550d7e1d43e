//! Ticker Statistics
//!
//! Rolling 24-hour market statistics per symbol, fed from executed trades.
//! Backs the `price:<symbol>` event payload and the REST ticker endpoint.

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;

const WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize)]
pub struct TickerStats {
    pub symbol: String,
    pub last_price: Decimal,
    pub last_quantity: Decimal,
    pub change_24h: Decimal,
    pub change_percent_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Default)]
struct SymbolWindow {
    /// (executed_at ms, price, quantity), oldest first.
    trades: VecDeque<(i64, Decimal, Decimal)>,
}

impl SymbolWindow {
    fn prune(&mut self, now_ms: i64) {
        while let Some((ts, _, _)) = self.trades.front() {
            if now_ms - ts > WINDOW_MS {
                self.trades.pop_front();
            } else {
                break;
            }
        }
    }

    fn stats(&self, symbol: &str, now_ms: i64) -> Option<TickerStats> {
        let (last_ts, last_price, last_qty) = *self.trades.back()?;
        let open = self.trades.front().map(|(_, p, _)| *p).unwrap_or(last_price);

        let mut high = last_price;
        let mut low = last_price;
        let mut volume = Decimal::ZERO;
        for (_, price, qty) in &self.trades {
            if *price > high {
                high = *price;
            }
            if *price < low {
                low = *price;
            }
            volume += *qty;
        }

        let change = last_price - open;
        let change_percent = if open.is_zero() {
            Decimal::ZERO
        } else {
            (change / open * Decimal::ONE_HUNDRED).round_dp(4)
        };

        Some(TickerStats {
            symbol: symbol.to_string(),
            last_price,
            last_quantity: last_qty,
            change_24h: change,
            change_percent_24h: change_percent,
            high_24h: high,
            low_24h: low,
            volume_24h: volume,
            timestamp: now_ms.max(last_ts),
        })
    }
}

pub struct TickerService {
    windows: DashMap<String, Mutex<SymbolWindow>>,
}

impl TickerService {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Fold one executed trade into the symbol's window and return the
    /// refreshed statistics.
    pub fn record_trade(
        &self,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        executed_at: i64,
    ) -> TickerStats {
        let window = self
            .windows
            .entry(symbol.to_string())
            .or_insert_with(|| Mutex::new(SymbolWindow::default()));
        let mut win = window.lock();
        win.trades.push_back((executed_at, price, quantity));
        win.prune(executed_at);
        // The window is never empty here: we just pushed.
        win.stats(symbol, executed_at)
            .unwrap_or_else(|| TickerStats {
                symbol: symbol.to_string(),
                last_price: price,
                last_quantity: quantity,
                change_24h: Decimal::ZERO,
                change_percent_24h: Decimal::ZERO,
                high_24h: price,
                low_24h: price,
                volume_24h: quantity,
                timestamp: executed_at,
            })
    }

    pub fn stats(&self, symbol: &str, now_ms: i64) -> Option<TickerStats> {
        let window = self.windows.get(symbol)?;
        let mut win = window.lock();
        win.prune(now_ms);
        win.stats(symbol, now_ms)
    }
}

impl Default for TickerService {
    fn default() -> Self {
        Self::new()
    }
}
