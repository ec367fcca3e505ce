use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::adapters::AdapterError;
use crate::services::account_pool::AccountPoolError;
use crate::services::creation::CreationError;

/// Crate-wide error taxonomy visible to HTTP callers. Worker-path errors
/// are persisted on the `Generation` row instead of propagating here; this
/// type only wraps what the create/cancel/retry endpoints can surface.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error(transparent)]
    AccountPool(#[from] AccountPoolError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<CreationError> for AppError {
    fn from(err: CreationError) -> Self {
        match err {
            CreationError::InvalidOperation(msg) => AppError::InvalidOperation(msg),
            CreationError::UnstructuredParams => {
                AppError::InvalidOperation(CreationError::UnstructuredParams.to_string())
            }
            CreationError::Quota(msg) => AppError::Quota(msg),
            CreationError::UnknownRating(msg) => AppError::InvalidOperation(msg),
            CreationError::Database(e) => AppError::Database(e),
            CreationError::Internal(e) => AppError::Internal(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            AppError::Quota(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::AccountPool(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Adapter(_) => StatusCode::BAD_GATEWAY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error handling request");
        }

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
