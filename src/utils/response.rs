//! API Response Envelope
//!
//! Uniform success/error envelope for the REST surface. Error codes and
//! HTTP statuses derive from the engine's error taxonomy; handlers never
//! assemble code strings by hand.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::services::matching::ExchangeError;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Failures a handler can surface. Engine errors carry the taxonomy with
/// them; the remaining variants cover edge-only conditions that have no
/// engine counterpart.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Exchange(err) => err.code(),
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Exchange(err) => match err {
                ExchangeError::Validation(_)
                | ExchangeError::UnknownSymbol(_)
                | ExchangeError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
                ExchangeError::NotFound(_) => StatusCode::NOT_FOUND,
                ExchangeError::NotOwner { .. } => StatusCode::FORBIDDEN,
                ExchangeError::InvalidStateTransition(_) => StatusCode::CONFLICT,
                ExchangeError::InconsistentState(_) => StatusCode::SERVICE_UNAVAILABLE,
                ExchangeError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: self.code(),
                message: self.to_string(),
            }),
            timestamp: chrono::Utc::now().timestamp(),
        };
        (self.status(), Json(body)).into_response()
    }
}
