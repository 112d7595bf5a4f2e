//! Bearer-token authentication, applied to every route except the
//! documented exempt paths.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use super::envelope::LegacyEnvelope;
use super::AppState;
use crate::error::AppError;

/// Paths that never require a bearer token.
const EXEMPT_PATHS: [&str; 2] = ["/api/auth/login", "/api/auth/status"];

fn is_exempt(path: &str) -> bool {
    if EXEMPT_PATHS.contains(&path) {
        return true;
    }
    !path.starts_with("/api/")
}

/// Validates `Authorization: Bearer <token>` against `Auth::verify`,
/// short-circuiting with 401 on failure. `OPTIONS` requests and exempt
/// paths bypass the check entirely.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == axum::http::Method::OPTIONS || is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return AppError::Unauthenticated.into_legacy_response();
    };

    if state.auth.verify(token).await.is_err() {
        return AppError::Unauthenticated.into_legacy_response();
    }

    next.run(request).await
}

impl AppError {
    fn into_legacy_response(self) -> Response {
        use axum::response::IntoResponse;
        let status = self.status_code();
        (status, LegacyEnvelope::err(self.to_string())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exempt_paths_cover_login_and_status() {
        assert!(is_exempt("/api/auth/login"));
        assert!(is_exempt("/api/auth/status"));
        assert!(!is_exempt("/api/auth/logout"));
    }

    #[test]
    fn non_api_paths_are_exempt_for_static_assets() {
        assert!(is_exempt("/index.html"));
        assert!(!is_exempt("/api/info"));
    }
}
