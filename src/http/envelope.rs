//! The two response envelope shapes the HTTP surface exposes.
//!
//! Every endpoint picks exactly one of these, documented on its handler;
//! the shape never varies per-request.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

/// `{"Code": 0|1, "Error": "", "Data": ...}` — the original envelope.
#[derive(Debug, Serialize)]
pub struct LegacyEnvelope {
    #[serde(rename = "Code")]
    /// `code`.
    pub code: i32,
    #[serde(rename = "Error")]
    /// `error`.
    pub error: String,
    #[serde(rename = "Data")]
    /// `data`.
    pub data: Value,
}

impl LegacyEnvelope {
    #[must_use]
    /// `ok`.
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            code: 0,
            error: String::new(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    #[must_use]
    /// `err`.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            error: message.into(),
            data: Value::Null,
        }
    }
}

impl IntoResponse for LegacyEnvelope {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// `{"status": "ok"|"error", "message": "", "data": ...}` — the newer
/// envelope.
#[derive(Debug, Serialize)]
pub struct Envelope {
    /// `status`.
    pub status: &'static str,
    /// `message`.
    pub message: String,
    /// `data`.
    pub data: Value,
}

impl Envelope {
    #[must_use]
    /// `ok`.
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            status: "ok",
            message: String::new(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    #[must_use]
    /// `err`.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
            data: Value::Null,
        }
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Wraps an `AppError` so it renders as a `LegacyEnvelope` with the
/// matching HTTP status code. Used by `?`-propagating legacy-shaped
/// handlers.
pub struct LegacyError(pub crate::error::AppError);

impl From<crate::error::AppError> for LegacyError {
    fn from(e: crate::error::AppError) -> Self {
        Self(e)
    }
}

impl IntoResponse for LegacyError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, LegacyEnvelope::err(self.0.to_string())).into_response()
    }
}

/// Wraps an `AppError` so it renders as an `Envelope` with the matching
/// HTTP status code. Used by `?`-propagating newer-shaped handlers.
pub struct EnvelopeError(pub crate::error::AppError);

impl From<crate::error::AppError> for EnvelopeError {
    fn from(e: crate::error::AppError) -> Self {
        Self(e)
    }
}

impl IntoResponse for EnvelopeError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Envelope::err(self.0.to_string())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_ok_has_zero_code_and_empty_error() {
        let env = LegacyEnvelope::ok(serde_json::json!({"a": 1}));
        assert_eq!(env.code, 0);
        assert!(env.error.is_empty());
    }

    #[test]
    fn legacy_err_has_nonzero_code_and_null_data() {
        let env = LegacyEnvelope::err("boom");
        assert_eq!(env.code, 1);
        assert_eq!(env.data, Value::Null);
    }

    #[test]
    fn envelope_ok_has_ok_status() {
        let env = Envelope::ok(serde_json::json!([1, 2]));
        assert_eq!(env.status, "ok");
    }

    #[test]
    fn envelope_err_has_error_status() {
        let env = Envelope::err("boom");
        assert_eq!(env.status, "error");
        assert_eq!(env.message, "boom");
    }
}
