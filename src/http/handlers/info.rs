//! `GET /api/info`, `POST /api/at` — device snapshot and raw AT passthrough.
//!
//! Both use the legacy `{Code, Error, Data}` envelope.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::http::envelope::{LegacyEnvelope, LegacyError};
use crate::http::AppState;

pub async fn info(State(state): State<Arc<AppState>>) -> Result<LegacyEnvelope, LegacyError> {
    let info = state.modem.get_info().await?;
    Ok(LegacyEnvelope::ok(info))
}

#[derive(Debug, Deserialize)]
pub struct AtRequest {
    pub command: String,
}

pub async fn execute_at(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AtRequest>,
) -> Result<LegacyEnvelope, LegacyError> {
    let reply = state.modem.execute_at(&req.command).await?;
    Ok(LegacyEnvelope::ok(reply))
}
