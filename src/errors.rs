use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not authenticated: {0}")]
    Unauthenticated(String),

    #[error("token expired")]
    TokenExpired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Every generated token collided with an existing one.
    #[error("token space exhausted")]
    TokenSpaceExhausted,

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(what) => AppError::Conflict(what),
            other => AppError::Store(other),
        }
    }
}

impl AppError {
    /// True for both flavours of rejected credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, AppError::Unauthenticated(_) | AppError::TokenExpired)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::Unauthenticated(reason) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "not_authenticated",
                reason.clone(),
            ),
            AppError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "token_expired",
                "token expired".to_string(),
            ),
            AppError::Forbidden(reason) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "forbidden",
                reason.clone(),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "not_found",
                what.clone(),
            ),
            AppError::Conflict(what) => (
                StatusCode::CONFLICT,
                "conflict_error",
                "conflict",
                what.clone(),
            ),
            AppError::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "bad_request",
                reason.clone(),
            ),
            AppError::TokenSpaceExhausted => {
                tracing::error!("token space exhausted while issuing a session token");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "token_space_exhausted",
                    "token space exhausted".to_string(),
                )
            }
            AppError::Store(e) => {
                tracing::error!("Store error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::Unauthenticated("x".into()), StatusCode::UNAUTHORIZED),
            (AppError::TokenExpired, StatusCode::UNAUTHORIZED),
            (AppError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::Conflict("x".into()), StatusCode::CONFLICT),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::TokenSpaceExhausted, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_store_conflict_maps_to_conflict() {
        let err: AppError = StoreError::Conflict("users.name".into()).into();
        assert!(matches!(err, AppError::Conflict(_)));

        let err: AppError = StoreError::Corrupt("bad scope".into()).into();
        assert!(matches!(err, AppError::Store(_)));
    }
}
