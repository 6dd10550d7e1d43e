//! Order API Handlers
//!
//! Thin adapters between HTTP and the matching engine. Identity management
//! is an external collaborator: requests carry the caller's `user_id`
//! directly (as a decimal string, like every id crossing the trust
//! boundary).

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{
    id_str, CreateOrderRequest, OrderStatus, OrderView, UserTradeView,
};
use crate::services::matching::{CancelAllOutcome, SubmitRequest};
use crate::services::orders::OrderFilter;
use crate::utils::response::{ApiError, ApiResponse};
use crate::AppState;

/// Upper bound on waiting for a symbol's serialisation point before the
/// request is abandoned as cancelled.
const ENGINE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct UserParam {
    #[serde(with = "id_str")]
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CancelAllParams {
    #[serde(with = "id_str")]
    pub user_id: i64,
    pub symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersParams {
    #[serde(with = "id_str")]
    pub user_id: i64,
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
    pub limit: Option<usize>,
    pub before: Option<i64>,
    pub after: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UserTradesParams {
    #[serde(with = "id_str")]
    pub user_id: i64,
    pub symbol: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub order: OrderView,
    pub trades: Vec<UserTradeView>,
}

/// Create a new order
/// POST /orders
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Json<ApiResponse<SubmitResponse>>, ApiError> {
    let user_id = req.user_id;
    let outcome = state
        .engine
        .submit_with_deadline(
            SubmitRequest {
                user_id,
                symbol: req.symbol.to_uppercase(),
                side: req.side,
                order_type: req.order_type,
                quantity: req.quantity,
                price: req.price,
                client_order_id: req.client_order_id,
            },
            ENGINE_WAIT,
        )
        .await?;

    let trades = outcome
        .trades
        .iter()
        .map(|trade| UserTradeView::for_user(trade, user_id))
        .collect();
    Ok(Json(ApiResponse::ok(SubmitResponse {
        order: (&outcome.order).into(),
        trades,
    })))
}

/// Cancel one order
/// DELETE /orders/:order_id
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<i64>,
    Query(params): Query<UserParam>,
) -> Result<Json<ApiResponse<OrderView>>, ApiError> {
    let cancelled = state
        .engine
        .cancel_with_deadline(params.user_id, order_id, ENGINE_WAIT)
        .await?;
    Ok(Json(ApiResponse::ok((&cancelled).into())))
}

/// Cancel all open orders, optionally scoped to one symbol
/// DELETE /orders
pub async fn cancel_all_orders(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CancelAllParams>,
) -> Json<ApiResponse<CancelAllOutcome>> {
    let outcome = state
        .engine
        .cancel_all(params.user_id, params.symbol.as_deref())
        .await;
    Json(ApiResponse::ok(outcome))
}

/// GET /orders/:order_id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<i64>,
) -> Result<Json<ApiResponse<OrderView>>, ApiError> {
    let order = state
        .orders
        .get(order_id)
        .ok_or_else(|| ApiError::not_found(format!("order {} not found", order_id)))?;
    Ok(Json(ApiResponse::ok((&order).into())))
}

/// GET /orders
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListOrdersParams>,
) -> Json<ApiResponse<Vec<OrderView>>> {
    let filter = OrderFilter {
        symbol: params.symbol.map(|s| s.to_uppercase()),
        status: params.status,
        before: params.before,
        after: params.after,
        limit: Some(params.limit.unwrap_or(50).clamp(1, 500)),
    };
    let orders = state.orders.list_by_user(params.user_id, &filter);
    Json(ApiResponse::ok(
        orders.iter().map(OrderView::from).collect(),
    ))
}

/// GET /orders/open
pub async fn list_open_orders(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CancelAllParams>,
) -> Json<ApiResponse<Vec<OrderView>>> {
    let orders = state
        .orders
        .list_open(Some(params.user_id), params.symbol.as_deref());
    Json(ApiResponse::ok(
        orders.iter().map(OrderView::from).collect(),
    ))
}

/// Trades an order participated in
/// GET /orders/:order_id/trades
pub async fn get_order_trades(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<i64>,
) -> Result<Json<ApiResponse<Vec<UserTradeView>>>, ApiError> {
    let order = state
        .orders
        .get(order_id)
        .ok_or_else(|| ApiError::not_found(format!("order {} not found", order_id)))?;
    let trades = state
        .history
        .by_order(order_id)
        .iter()
        .map(|trade| UserTradeView::for_user(trade, order.user_id))
        .collect();
    Ok(Json(ApiResponse::ok(trades)))
}

/// A user's recent trades
/// GET /trades
pub async fn list_user_trades(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserTradesParams>,
) -> Json<ApiResponse<Vec<UserTradeView>>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let trades = state
        .history
        .by_user(params.user_id, params.symbol.as_deref(), limit)
        .iter()
        .map(|trade| UserTradeView::for_user(trade, params.user_id))
        .collect();
    Json(ApiResponse::ok(trades))
}
