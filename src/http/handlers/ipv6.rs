//! `/api/ipv6-proxy/config`, `/api/ipv6-proxy/rules[/:id]`,
//! `/api/ipv6-proxy/{start,stop,restart,send,test,status,send-logs}` — all
//! rendered with the newer `{status, message, data}` envelope.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use crate::http::AppState;
use crate::http::envelope::{Envelope, EnvelopeError};
use crate::ipv6fwd::Ipv6Config;

pub async fn get_config(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let config = state.ipv6fwd.config().await?;
    Ok(Envelope::ok(config))
}

pub async fn save_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<Ipv6Config>,
) -> Result<Envelope, EnvelopeError> {
    state.ipv6fwd.save_config(req).await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let rules = state.ipv6fwd.list_rules().await?;
    Ok(Envelope::ok(rules))
}

#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    pub local_port: u16,
    pub ipv6_port: u16,
}

pub async fn add_rule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RuleRequest>,
) -> Result<Envelope, EnvelopeError> {
    let local_port = req.local_port.try_into().map_err(|_| EnvelopeError::from(
        crate::error::AppError::InvalidArgument("local_port out of range".to_string()),
    ))?;
    let ipv6_port = req.ipv6_port.try_into().map_err(|_| EnvelopeError::from(
        crate::error::AppError::InvalidArgument("ipv6_port out of range".to_string()),
    ))?;
    let id = state.ipv6fwd.add_rule(local_port, ipv6_port).await?;
    Ok(Envelope::ok(serde_json::json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

pub async fn set_enabled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<EnabledRequest>,
) -> Result<Envelope, EnvelopeError> {
    state.ipv6fwd.set_enabled(id, req.enabled).await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Envelope, EnvelopeError> {
    state.ipv6fwd.delete_rule(id).await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn start(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    state.ipv6fwd.start().await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn stop(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    state.ipv6fwd.stop().await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn restart(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    state.ipv6fwd.restart().await?;
    Ok(Envelope::ok(serde_json::Value::Null))
}

pub async fn send(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let sent = state.ipv6fwd.send_report_once().await?;
    Ok(Envelope::ok(serde_json::json!({ "sent": sent })))
}

pub async fn test(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let sent = state.ipv6fwd.send_report_once().await?;
    Ok(Envelope::ok(serde_json::json!({ "sent": sent })))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let status = state.ipv6fwd.status().await;
    Ok(Envelope::ok(status))
}

pub async fn send_logs(State(state): State<Arc<AppState>>) -> Result<Envelope, EnvelopeError> {
    let log = state.ipv6fwd.send_log().await;
    Ok(Envelope::ok(log))
}
