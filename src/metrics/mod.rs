//! Metrics Module
//!
//! Prometheus-compatible counters and gauges for the engine, the write
//! path, and the WebSocket layer.

#![allow(dead_code)]

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Metric names as constants for consistency
pub mod names {
    // Matching Engine
    pub const ORDERS_SUBMITTED_TOTAL: &str = "orders_submitted_total";
    pub const ORDERS_REJECTED_TOTAL: &str = "orders_rejected_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";
    pub const TRADES_EXECUTED_TOTAL: &str = "trades_executed_total";
    pub const TRADE_NOTIONAL_TOTAL: &str = "trade_notional_total";
    pub const SYMBOL_HALTS_TOTAL: &str = "symbol_halts_total";

    // Write path
    pub const STORE_FLUSH_ENTRIES_TOTAL: &str = "store_flush_entries_total";
    pub const STORE_FLUSH_FAILURES_TOTAL: &str = "store_flush_failures_total";
    pub const WRITE_QUEUE_PENDING: &str = "write_queue_pending";

    // WebSocket
    pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
    pub const WS_MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";
}

/// Label keys
pub mod labels {
    pub const ORDER_SIDE: &str = "side";
    pub const ORDER_TYPE: &str = "order_type";
    pub const SYMBOL: &str = "symbol";
    pub const REASON: &str = "reason";
    pub const CATEGORY: &str = "category";
}

/// Install the Prometheus recorder; the handle renders `/metrics`.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

pub fn record_order_submitted(side: &str, order_type: &str) {
    counter!(
        names::ORDERS_SUBMITTED_TOTAL,
        labels::ORDER_SIDE => side.to_string(),
        labels::ORDER_TYPE => order_type.to_string()
    )
    .increment(1);
}

pub fn record_order_rejected(reason: &str) {
    counter!(
        names::ORDERS_REJECTED_TOTAL,
        labels::REASON => reason.to_string()
    )
    .increment(1);
}

pub fn record_order_cancelled() {
    counter!(names::ORDERS_CANCELLED_TOTAL).increment(1);
}

pub fn record_trade_executed(symbol: &str, notional: Decimal) {
    counter!(
        names::TRADES_EXECUTED_TOTAL,
        labels::SYMBOL => symbol.to_string()
    )
    .increment(1);
    counter!(
        names::TRADE_NOTIONAL_TOTAL,
        labels::SYMBOL => symbol.to_string()
    )
    .increment(notional.to_u64().unwrap_or(0));
}

pub fn record_symbol_halt(symbol: &str) {
    counter!(
        names::SYMBOL_HALTS_TOTAL,
        labels::SYMBOL => symbol.to_string()
    )
    .increment(1);
}

pub fn record_flush(category: &str, entries: usize) {
    counter!(
        names::STORE_FLUSH_ENTRIES_TOTAL,
        labels::CATEGORY => category.to_string()
    )
    .increment(entries as u64);
}

pub fn record_flush_failure(category: &str) {
    counter!(
        names::STORE_FLUSH_FAILURES_TOTAL,
        labels::CATEGORY => category.to_string()
    )
    .increment(1);
}

pub fn set_pending_writes(orders: usize, trades: usize, assets: usize) {
    gauge!(names::WRITE_QUEUE_PENDING, labels::CATEGORY => "orders").set(orders as f64);
    gauge!(names::WRITE_QUEUE_PENDING, labels::CATEGORY => "trades").set(trades as f64);
    gauge!(names::WRITE_QUEUE_PENDING, labels::CATEGORY => "assets").set(assets as f64);
}

pub fn ws_connection_opened() {
    gauge!(names::WS_CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn ws_connection_closed() {
    gauge!(names::WS_CONNECTIONS_ACTIVE).decrement(1.0);
}

pub fn record_ws_message_sent() {
    counter!(names::WS_MESSAGES_SENT_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert_eq!(names::ORDERS_SUBMITTED_TOTAL, "orders_submitted_total");
        assert_eq!(names::TRADES_EXECUTED_TOTAL, "trades_executed_total");
        assert_eq!(names::WRITE_QUEUE_PENDING, "write_queue_pending");
    }
}
