// Common DTOs and errors for the public API
//
// These types are shared across multiple API endpoints.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use threadline_storage::StoreError;
use utoipa::ToSchema;

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize, ToSchema, thiserror::Error)]
#[error("{error}")]
pub struct ApiError {
    pub error: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            status: StatusCode::NOT_FOUND,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn history_disabled() -> Self {
        Self {
            error: "thread history is disabled".to_string(),
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Map a store error, logging anything that is not a missing record
///
/// Use as `.map_err(store_error("get thread"))`.
pub fn store_error(action: &'static str) -> impl FnOnce(StoreError) -> ApiError {
    move |e| match e {
        StoreError::NotFound(what) => ApiError::not_found(format!("{} not found", what)),
        e => {
            tracing::error!("Failed to {}: {}", action, e);
            ApiError::internal(format!("failed to {}", action))
        }
    }
}
