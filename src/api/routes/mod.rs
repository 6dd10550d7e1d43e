use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::AppState;

pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        // Orders
        .route("/orders", post(handlers::order::create_order))
        .route("/orders", get(handlers::order::list_orders))
        .route("/orders", delete(handlers::order::cancel_all_orders))
        .route("/orders/open", get(handlers::order::list_open_orders))
        .route("/orders/:order_id", get(handlers::order::get_order))
        .route("/orders/:order_id", delete(handlers::order::cancel_order))
        .route("/orders/:order_id/trades", get(handlers::order::get_order_trades))
        .route("/trades", get(handlers::order::list_user_trades))
        // Market data
        .route("/market/pairs", get(handlers::market::list_pairs))
        .route("/market/depth/:symbol", get(handlers::market::get_depth))
        .route("/market/ticker/:symbol", get(handlers::market::get_ticker))
        .route("/market/trades/:symbol", get(handlers::market::get_market_trades))
        // Assets
        .route("/assets", get(handlers::account::get_assets))
        .route("/assets/:symbol", get(handlers::account::get_asset))
        // Admin
        .route("/admin/trading-pairs", post(handlers::admin::create_trading_pair))
        .route("/admin/assets/deposit", post(handlers::admin::deposit))
        .route("/admin/assets/initialize", post(handlers::admin::initialize_assets))
}
