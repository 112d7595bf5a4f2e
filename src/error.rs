//! Crate-wide error type for `cirrusd`.
//!
//! Every fallible operation in the daemon eventually bottoms out in
//! [`AppError`], which carries the error-kind taxonomy of the appliance's
//! HTTP surface (invalid argument, unauthenticated, not found, ...). HTTP
//! handlers map an `AppError` to a status code and to whichever response
//! envelope the endpoint uses.

use axum::http::StatusCode;
use thiserror::Error;

/// Error kinds surfaced by the HTTP API.
#[derive(Error, Debug)]
pub enum AppError {
    /// Client supplied a missing or out-of-range parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing or expired bearer token.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Unknown endpoint or id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Method not allowed for this path.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// One-time resource already in its terminal state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Bus or modem daemon not reachable; self-healing is in progress.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Database, process-spawn, or filesystem failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// A webhook delivery failed; the triggering API call itself succeeded.
    #[error("upstream delivery failed: {0}")]
    UpstreamFailed(String),
}

impl AppError {
    /// HTTP status code for this error kind.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) | Self::Internal(_) | Self::UpstreamFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<crate::store::StoreError> for AppError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<zbus::Error> for AppError {
    fn from(e: zbus::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_each_error_kind() {
        assert_eq!(
            AppError::InvalidArgument("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unauthenticated.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            AppError::Unavailable("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
