//! `/api/rathole/config`, `/api/rathole/services[/:id]`,
//! `/api/rathole/{start,stop,restart,status,logs,server-config}` — all
//! rendered with the newer `{status, message, data}` envelope.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;

use crate::http::AppState;
use crate::http::envelope::{Envelope, EnvelopeError};
use crate::rathole::RatholeConfig;

pub async fn get_config(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let config = state.rathole.config().await?;
    Ok(Envelope::ok(config))
}

pub async fn save_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RatholeConfig>,
) -> Result<Envelope, EnvelopeError> {
    state.rathole.save_config(req).await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn list_services(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let services = state.rathole.list_services().await?;
    Ok(Envelope::ok(services))
}

#[derive(Debug, Deserialize)]
pub struct ServiceRequest {
    pub name: String,
    pub token: String,
    pub local_addr: String,
}

pub async fn add_service(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ServiceRequest>,
) -> Result<Envelope, EnvelopeError> {
    let id = state.rathole.add_service(&req.name, &req.token, &req.local_addr).await?;
    Ok(Envelope::ok(serde_json::json!({ "id": id })))
}

pub async fn update_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ServiceRequest>,
) -> Result<Envelope, EnvelopeError> {
    state.rathole.update_service(id, &req.name, &req.token, &req.local_addr).await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Envelope, EnvelopeError> {
    state.rathole.delete_service(id).await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn start(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    state.rathole.start().await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn stop(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    state.rathole.stop().await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn restart(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    state.rathole.restart().await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let status = state.rathole.status().await?;
    Ok(Envelope::ok(status))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

fn default_log_lines() -> usize {
    200
}

pub async fn logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Envelope, EnvelopeError> {
    let text = state.rathole.tail_log(query.lines).await?;
    Ok(Envelope::ok(serde_json::json!({ "log": text })))
}

pub async fn server_config(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let (toml, script) = state.rathole.server_config().await?;
    Ok(Envelope::ok(serde_json::json!({ "toml": toml, "install_script": script })))
}
