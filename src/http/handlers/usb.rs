//! `/api/usb/mode`, `/api/usb-advance` — legacy-enveloped.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Deserialize;

use crate::domain_types::UsbModeValue;
use crate::http::AppState;
use crate::http::envelope::{LegacyEnvelope, LegacyError};

pub async fn get_mode(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let mode = state.usb_mode.current_mode().await?;
    let hardware = state.usb_mode.hardware_mode().await?;
    Ok(LegacyEnvelope::ok(serde_json::json!({ "mode": mode, "hardware_mode": hardware })))
}

#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    pub mode: UsbModeValue,
    #[serde(default)]
    pub permanent: bool,
}

pub async fn set_mode(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetModeRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    if req.permanent {
        state.usb_mode.set_mode_persistent(req.mode).await?;
    } else {
        state.usb_mode.set_mode_transient(req.mode).await?;
    }
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct AdvanceRequest {
    pub mode: UsbModeValue,
}

pub async fn advance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AdvanceRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    state.usb_mode.switch_advanced(req.mode).await?;
    Ok(LegacyEnvelope::ok(serde_json::Value::Null))
}
