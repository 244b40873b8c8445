use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /calls — active calls from the controller snapshot.
pub async fn list_calls(State(state): State<Arc<AppState>>) -> Json<Value> {
    let calls: Vec<Value> = state
        .sip
        .snapshot()
        .calls
        .iter()
        .map(|entry| serde_json::to_value(entry.value()).unwrap_or(Value::Null))
        .collect();
    Json(json!({ "calls": calls }))
}
