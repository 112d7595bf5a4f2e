//! `/api/apn/templates[/:id]`, `/api/apn/config`, `/api/apn/apply`,
//! `/api/apn/clear` — all legacy-enveloped.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use crate::apn::ApnConfigView;
use crate::http::AppState;
use crate::http::envelope::{LegacyEnvelope, LegacyError};

pub async fn list_templates(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let templates = state.apn.list_templates().await?;
    Ok(LegacyEnvelope::ok(templates))
}

#[derive(Debug, Deserialize)]
pub struct TemplateRequest {
    pub name: String,
    pub apn: String,
    pub protocol: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub auth_method: String,
}

pub async fn add_template(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TemplateRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    let id = state
        .apn
        .add_template(&req.name, &req.apn, &req.protocol, &req.username, &req.password, &req.auth_method)
        .await?;
    Ok(LegacyEnvelope::ok(serde_json::json!({ "id": id })))
}

pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<TemplateRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state
        .apn
        .update_template(id, &req.apn, &req.protocol, &req.username, &req.password, &req.auth_method)
        .await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.apn.delete_template(id).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let config = state.apn.config().await?;
    Ok(LegacyEnvelope::ok(config))
}

pub async fn save_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApnConfigView>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.apn.save_config(req).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    pub template_id: i64,
}

pub async fn apply(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApplyRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.apn.apply_template(req.template_id).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn clear(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    state.apn.clear().await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}
