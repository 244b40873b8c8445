use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness probe with controller counters.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.sip.snapshot();
    Json(json!({
        "status": "ok",
        "registered_devices": snapshot.registered_count(),
        "active_calls": snapshot.calls.len(),
        "guardian_active": state.supervisor.active_sessions(),
    }))
}
