//! Account API Handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use crate::api::handlers::order::UserParam;
use crate::models::AssetView;
use crate::utils::response::{ApiError, ApiResponse};
use crate::AppState;

/// All balance records for a user
/// GET /assets
pub async fn get_assets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserParam>,
) -> Json<ApiResponse<Vec<AssetView>>> {
    Json(ApiResponse::ok(state.ledger.list_by_user(params.user_id)))
}

/// One balance record
/// GET /assets/:symbol
pub async fn get_asset(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<UserParam>,
) -> Result<Json<ApiResponse<AssetView>>, ApiError> {
    let symbol = symbol.to_uppercase();
    let view = state
        .ledger
        .get(params.user_id, &symbol)
        .ok_or_else(|| {
            ApiError::not_found(format!(
                "no {} balance for user {}",
                symbol, params.user_id
            ))
        })?;
    Ok(Json(ApiResponse::ok(view)))
}
