//! `/api/auth/{login,logout,status,password,security-questions,factory-reset}`
//! — legacy-enveloped.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;

use crate::auth::RecoveryRequest;
use crate::http::AppState;
use crate::http::envelope::{LegacyEnvelope, LegacyError};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    let token = state.auth.login(&req.password).await?;
    Ok(LegacyEnvelope::ok(serde_json::json!({ "token": token })))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<LegacyEnvelope, LegacyError> {
    if let Some(token) = bearer_token(&headers) {
        state.auth.logout(token).await?;
    }
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<LegacyEnvelope, LegacyError> {
    let authenticated = match bearer_token(&headers) {
        Some(token) => state.auth.verify(token).await.is_ok(),
        None => false,
    };
    Ok(LegacyEnvelope::ok(serde_json::json!({ "authenticated": authenticated })))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.auth.change_password(&req.old_password, &req.new_password).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct SetupQuestionsRequest {
    pub question1: String,
    pub question2: String,
    pub answer1: String,
    pub answer2: String,
}

pub async fn setup_security_questions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetupQuestionsRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state
        .auth
        .setup_security_questions(&req.question1, &req.question2, &req.answer1, &req.answer2)
        .await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct RecoveryRequestBody {
    pub answer1: String,
    pub answer2: String,
    pub confirmation: String,
}

impl From<RecoveryRequestBody> for RecoveryRequest {
    fn from(body: RecoveryRequestBody) -> Self {
        Self { answer1: body.answer1, answer2: body.answer2, confirmation: body.confirmation }
    }
}

pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecoveryRequestBody>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.auth.reset_password(&req.into()).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn factory_reset(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecoveryRequestBody>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.auth.factory_reset(&req.into()).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}
