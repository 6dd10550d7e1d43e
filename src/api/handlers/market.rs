//! Market Data API Handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{TradeView, TradingPairView};
use crate::services::matching::DepthSnapshot;
use crate::utils::response::{ApiError, ApiResponse};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DepthParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TradesParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TickerResponse {
    pub symbol: String,
    pub last_price: Decimal,
    pub change_24h: Decimal,
    pub change_percent_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub volume_24h: Decimal,
    pub mid_price: Option<Decimal>,
    pub timestamp: i64,
}

/// GET /market/pairs
pub async fn list_pairs(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<TradingPairView>>> {
    let pairs = state
        .engine
        .pairs()
        .into_iter()
        .map(TradingPairView::from)
        .collect();
    Json(ApiResponse::ok(pairs))
}

/// Top-N aggregated book levels
/// GET /market/depth/:symbol
pub async fn get_depth(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<DepthParams>,
) -> Result<Json<ApiResponse<DepthSnapshot>>, ApiError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let snapshot = state.engine.depth(&symbol.to_uppercase(), limit).await?;
    Ok(Json(ApiResponse::ok(snapshot)))
}

/// 24h rolling statistics
/// GET /market/ticker/:symbol
pub async fn get_ticker(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<TickerResponse>>, ApiError> {
    let symbol = symbol.to_uppercase();
    let mid_price = state.engine.mid_price(&symbol).await?;
    let now_ms = Utc::now().timestamp_millis();

    let response = match state.ticker.stats(&symbol, now_ms) {
        Some(stats) => TickerResponse {
            symbol,
            last_price: stats.last_price,
            change_24h: stats.change_24h,
            change_percent_24h: stats.change_percent_24h,
            high_24h: stats.high_24h,
            low_24h: stats.low_24h,
            volume_24h: stats.volume_24h,
            mid_price,
            timestamp: stats.timestamp,
        },
        // No trade yet in the window: an empty ticker, not an error.
        None => TickerResponse {
            symbol,
            last_price: Decimal::ZERO,
            change_24h: Decimal::ZERO,
            change_percent_24h: Decimal::ZERO,
            high_24h: Decimal::ZERO,
            low_24h: Decimal::ZERO,
            volume_24h: Decimal::ZERO,
            mid_price,
            timestamp: now_ms,
        },
    };
    Ok(Json(ApiResponse::ok(response)))
}

/// Recent public trades
/// GET /market/trades/:symbol
pub async fn get_market_trades(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<TradesParams>,
) -> Json<ApiResponse<Vec<TradeView>>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let trades = state
        .history
        .recent(&symbol.to_uppercase(), limit)
        .iter()
        .map(TradeView::from)
        .collect();
    Json(ApiResponse::ok(trades))
}
