//! REST error mapping
//!
//! Engine failures become JSON envelopes
//! `{error, code, errors?, context?}` with the HTTP status implied by
//! the taxonomy code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::core::error::{EngineError, ErrorCode};

/// Result type for REST handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// Engine error carried into an HTTP response
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidParams => StatusCode::BAD_REQUEST,
        ErrorCode::InvalidRelation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Unique => StatusCode::CONFLICT,
        ErrorCode::StorageError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let mut body = json!({
            "error": self.0.to_string(),
            "code": code.as_str(),
        });

        if let Some(issues) = self.0.issues() {
            body["errors"] = serde_json::to_value(issues).unwrap_or_default();
        }
        if let EngineError::Storage(storage) = &self.0 {
            body["context"] = json!({
                "operation": storage.operation,
                "class": storage.class_id,
                "id": storage.id,
            });
        }

        (status_for(code), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ValidationIssue;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(ErrorCode::ValidationFailed),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(ErrorCode::Unique), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorCode::StorageError),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_validation_errors_reach_the_body() {
        let err = ApiError(EngineError::ValidationFailed {
            class_id: "user".into(),
            issues: vec![ValidationIssue::new("name", "is required", "required")],
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
