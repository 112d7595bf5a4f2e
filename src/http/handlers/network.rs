//! `/api/set_network`, `/api/switch`, `/api/airplane_mode`, `/api/data`,
//! `/api/roaming`, `/api/current_band` — all legacy-enveloped.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Deserialize;

use crate::domain_types::{NetworkMode, Slot};
use crate::http::AppState;
use crate::http::envelope::{LegacyEnvelope, LegacyError};

#[derive(Debug, Deserialize)]
pub struct SetNetworkRequest {
    pub mode: NetworkMode,
    pub slot: Option<Slot>,
}

pub async fn set_network(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetNetworkRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.modem.set_network_mode(req.slot, req.mode).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub slot: Slot,
}

pub async fn switch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SwitchRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.modem.switch_slot(req.slot).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct AirplaneModeRequest {
    pub enabled: bool,
}

pub async fn airplane_mode(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AirplaneModeRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.modem.set_airplane(req.enabled).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn get_data(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let active = state.data_bearer.get_data_status().await?;
    Ok(LegacyEnvelope::ok(serde_json::json!({ "active": active })))
}

#[derive(Debug, Deserialize)]
pub struct DataRequest {
    pub active: bool,
}

pub async fn set_data(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DataRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.data_bearer.set_data_status(req.active).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn get_roaming(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let allowed = state.data_bearer.get_roaming().await?;
    Ok(LegacyEnvelope::ok(serde_json::json!({ "allowed": allowed })))
}

#[derive(Debug, Deserialize)]
pub struct RoamingRequest {
    pub allowed: bool,
}

pub async fn set_roaming(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RoamingRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.data_bearer.set_roaming_allowed(req.allowed).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

pub async fn current_band(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let band = state.modem.current_band().await?;
    Ok(LegacyEnvelope::ok(band))
}
