//! API error types.

use http::StatusCode;
use thiserror::Error;
use tracing::error;

use tessera_core::SessionError;

use crate::models::ErrorResponse;

/// Convenience alias for handler return types.
pub type ApiResult<T> = Result<T, ApiError>;

/// Failures that are not part of a response's `status`.
///
/// Unauthorised and try-refresh outcomes are reported inside response
/// bodies; only caller mistakes and internal faults end up here.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Status and body to send. Internal details are never exposed.
    pub fn into_response(self) -> (StatusCode, ErrorResponse) {
        let status = self.status();
        let (error, message) = match self {
            ApiError::Validation(m) => ("validation_error", m),
            ApiError::Unauthorized(m) => ("unauthorized", m),
            ApiError::Internal(m) => {
                error!(message = %m, "internal error");
                ("internal_error", "Internal server error".to_string())
            }
        };
        (
            status,
            ErrorResponse {
                error: error.to_string(),
                message,
            },
        )
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Format(msg) => ApiError::Validation(msg),
            SessionError::ProtectedClaim(name) => {
                ApiError::Validation(format!("'{name}' is a protected claim"))
            }
            SessionError::Unauthorised(msg) | SessionError::TryRefreshToken(msg) => {
                ApiError::Unauthorized(msg)
            }
            SessionError::TokenTheftDetected { session_handle, .. } => {
                ApiError::Unauthorized(format!("token theft detected for {session_handle}"))
            }
            e @ (SessionError::Store(_) | SessionError::Key(_) | SessionError::Internal(_)) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_bad_requests() {
        let err = ApiError::from(SessionError::ProtectedClaim("sub".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let (_, body) = err.into_response();
        assert_eq!(body.error, "validation_error");
        assert!(body.message.contains("sub"));
    }

    #[test]
    fn internal_details_are_hidden() {
        let err = ApiError::from(SessionError::Internal("db exploded".into()));
        let (status, body) = err.into_response();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, "Internal server error");
    }
}
