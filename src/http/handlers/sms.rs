//! `/api/sms[/:id]`, `/api/sms/webhook[/test]`, `/api/sms/config`,
//! `/api/sms/fix` — all legacy-enveloped.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use crate::http::AppState;
use crate::http::envelope::{LegacyEnvelope, LegacyError};
use crate::sms::WebhookConfigView;

pub async fn list(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let inbox = state.sms.list_inbox().await?;
    Ok(LegacyEnvelope::ok(inbox))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    pub content: String,
}

pub async fn send(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    let status = state.sms.send(&req.recipient, &req.content).await?;
    Ok(LegacyEnvelope::ok(serde_json::json!({ "status": status })))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.sms.delete_inbox(id).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn webhook_config(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let config = state.sms.webhook_config().await?;
    Ok(LegacyEnvelope::ok(config))
}

pub async fn save_webhook_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WebhookConfigView>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.sms.save_webhook_config(req).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn test_webhook(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    state.sms.test_webhook().await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let config = state.sms.config().await?;
    Ok(LegacyEnvelope::ok(config))
}

#[derive(Debug, Deserialize)]
pub struct ConfigRequest {
    pub max_inbox: u32,
    pub max_sent: u32,
}

pub async fn save_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConfigRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.sms.save_config(req.max_inbox, req.max_sent).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct FixRequest {
    pub enabled: bool,
}

pub async fn set_fix(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FixRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.sms.set_fix_enabled(req.enabled).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}
