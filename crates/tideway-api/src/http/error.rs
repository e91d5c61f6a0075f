//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use tideway_core::substrate::SubstrateError;
use tideway_types::error::RepositoryError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Storage failure.
    Repository(RepositoryError),
    /// No execution with this id.
    NotFound(String),
    /// Request cannot apply to the execution in its current phase.
    Conflict(String),
    /// Validation error.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound => AppError::NotFound("resource not found".to_string()),
            RepositoryError::Conflict(msg) => AppError::Conflict(msg),
            RepositoryError::InvalidPrefix(msg) => AppError::Validation(msg),
            e => AppError::Repository(e),
        }
    }
}

impl From<SubstrateError> for AppError {
    fn from(e: SubstrateError) -> Self {
        match e {
            SubstrateError::UnknownRun(_) => AppError::NotFound(e.to_string()),
            e => AppError::Conflict(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Repository(e) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", e.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, message = %message, "request failed");
        }

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_errors_map_to_status() {
        let (status, code, _) = AppError::from(RepositoryError::NotFound).parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "NOT_FOUND");

        let (status, _, _) = AppError::from(RepositoryError::InvalidPrefix(String::new())).parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, code, _) = AppError::from(RepositoryError::Query("disk full".into())).parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "STORAGE_ERROR");
    }
}
