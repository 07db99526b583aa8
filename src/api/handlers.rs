//! Request handlers for the API endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;

use super::AppState;
use crate::engine::{DeviceSummary, EngineState};

/// Returns the engine state as of the last control cycle.
///
/// `GET /state` → 200 + `EngineState` JSON
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<EngineState> {
    Json(state.state_rx.borrow().clone())
}

/// Returns per-device session summaries.
///
/// `GET /devices` → 200 + `Vec<DeviceSummary>` JSON
pub async fn get_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceSummary>> {
    Json(state.state_rx.borrow().devices.clone())
}
