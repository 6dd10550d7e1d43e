//! Admin API Handlers
//!
//! Administrative paths: trading-pair creation and the explicit
//! deposit/initialisation route into the asset ledger. These are the only
//! request handlers allowed to touch the durable store directly, since
//! pair creation must survive a restart that happens before the next flush.

use axum::{
    extract::{Json, State},
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::db::store;
use crate::models::{id_str, AssetView, CreateTradingPairRequest, TradingPairView};
use crate::utils::response::{ApiError, ApiResponse};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    #[serde(with = "id_str")]
    pub user_id: i64,
    pub symbol: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct InitializeAssetsRequest {
    #[serde(with = "id_str")]
    pub user_id: i64,
    pub balances: HashMap<String, Decimal>,
}

/// POST /admin/trading-pairs
pub async fn create_trading_pair(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTradingPairRequest>,
) -> Result<Json<ApiResponse<TradingPairView>>, ApiError> {
    let symbol = req.symbol.to_uppercase();
    if req.base_asset == req.quote_asset {
        return Err(ApiError::bad_request("base and quote assets must differ"));
    }
    if req.min_qty <= Decimal::ZERO || req.max_qty < req.min_qty {
        return Err(ApiError::bad_request("invalid quantity bounds"));
    }
    if state.engine.pair(&symbol).is_some() {
        return Err(ApiError::bad_request(format!(
            "trading pair {} already exists",
            symbol
        )));
    }

    let request = CreateTradingPairRequest {
        symbol: symbol.clone(),
        base_asset: req.base_asset.to_uppercase(),
        quote_asset: req.quote_asset.to_uppercase(),
        ..req
    };
    let pair = store::insert_trading_pair(&state.db.pool, &request)
        .await
        .map_err(|err| ApiError::internal(format!("could not persist pair: {}", err)))?;

    info!(symbol = %pair.symbol, id = pair.id, "trading pair created");
    state.engine.register_pair(pair.clone());
    Ok(Json(ApiResponse::ok(pair.into())))
}

/// Credit a user's available balance (the explicit deposit path).
/// POST /admin/assets/deposit
pub async fn deposit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DepositRequest>,
) -> Result<Json<ApiResponse<AssetView>>, ApiError> {
    if req.amount <= Decimal::ZERO {
        return Err(ApiError::bad_request("deposit amount must be positive"));
    }
    let symbol = req.symbol.to_uppercase();
    state
        .ledger
        .credit(req.user_id, &symbol, req.amount)
        .map_err(|err| ApiError::internal(err.to_string()))?;

    let view = state
        .ledger
        .get(req.user_id, &symbol)
        .ok_or_else(|| ApiError::internal("balance record missing after credit"))?;
    Ok(Json(ApiResponse::ok(view)))
}

/// Upsert starting balances for a user (idempotent).
/// POST /admin/assets/initialize
pub async fn initialize_assets(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitializeAssetsRequest>,
) -> Result<Json<ApiResponse<Vec<AssetView>>>, ApiError> {
    for (symbol, amount) in &req.balances {
        if *amount < Decimal::ZERO {
            return Err(ApiError::bad_request(format!(
                "negative starting balance for {}",
                symbol
            )));
        }
    }

    let balances: Vec<(String, Decimal)> = req
        .balances
        .into_iter()
        .map(|(symbol, amount)| (symbol.to_uppercase(), amount))
        .collect();
    state.ledger.initialize_user_assets(req.user_id, &balances);
    Ok(Json(ApiResponse::ok(
        state.ledger.list_by_user(req.user_id),
    )))
}
