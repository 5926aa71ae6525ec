//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tangle_engine::Error as EngineError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Engine(e) => match e {
                EngineError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
                EngineError::InvalidBatch(_)
                | EngineError::SelfReplication(_)
                | EngineError::NotConflicted(_)
                | EngineError::UnknownConflictHolder { .. } => StatusCode::BAD_REQUEST,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                ("Database error".to_string(), None)
            }
            AppError::Engine(e) if status.is_server_error() => {
                tracing::error!("Engine error: {:?}", e);
                ("Engine error".to_string(), Some(e.to_string()))
            }
            AppError::Engine(e) => {
                tracing::warn!("Engine error: {:?}", e);
                let details = e.is_retryable().then(|| "retry after re-reading the item".to_string());
                (e.to_string(), details)
            }
            AppError::BadRequest(msg) | AppError::NotFound(msg) => (msg.clone(), None),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ("Internal server error".to_string(), Some(msg.clone()))
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tangle_engine::Etag;

    #[test]
    fn test_engine_error_status() {
        let conflict = AppError::Engine(EngineError::ConcurrencyConflict {
            key: "users/1".into(),
            expected: Etag::new(1),
            actual: Etag::new(2),
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let self_replication = AppError::Engine(EngineError::SelfReplication("db-a".into()));
        assert_eq!(self_replication.status(), StatusCode::BAD_REQUEST);

        let missing = AppError::Engine(EngineError::NotFound("users/1".into()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let storage = AppError::Engine(EngineError::Storage("poisoned".into()));
        assert_eq!(storage.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_response_status() {
        let response = AppError::NotFound("docs/1".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
