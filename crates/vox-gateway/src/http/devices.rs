//! Extension administration: listing plus manual register/unregister kicks.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use vox_core::types::ExtensionId;
use vox_core::VoxError;

use crate::app::AppState;

/// GET /devices — configured extensions with their live registration flag.
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let devices = state.db.list_devices().map_err(internal)?;
    let snapshot = state.sip.snapshot();

    let out: Vec<Value> = devices
        .iter()
        .map(|d| {
            let live = snapshot
                .devices
                .get(&d.id)
                .map(|e| *e.value())
                .unwrap_or(false);
            json!({
                "id": d.id,
                "agent_config_id": d.agent_config_id,
                "server": d.server,
                "username": d.username,
                "status": d.status,
                "registered": live,
                "last_error": d.last_error,
                "registered_at": d.registered_at,
            })
        })
        .collect();
    Ok(Json(json!({ "devices": out })))
}

/// POST /devices/{id}/register — kick (re-)registration.
/// 400 when already registered, 404 when unknown.
pub async fn register_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let extension = ExtensionId::from(id);
    if state.db.get_device(&extension).map_err(internal)?.is_none() {
        return Err(not_found(&extension));
    }
    let already = state
        .sip
        .snapshot()
        .devices
        .get(&extension)
        .map(|e| *e.value())
        .unwrap_or(false);
    if already {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "already registered"})),
        ));
    }
    if !state.sip.register(extension.clone()).await {
        return Err(internal_msg("controller unavailable"));
    }
    Ok(Json(json!({"ok": true, "extension": extension})))
}

/// POST /devices/{id}/unregister — 404 when unknown.
pub async fn unregister_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let extension = ExtensionId::from(id);
    if state.db.get_device(&extension).map_err(internal)?.is_none() {
        return Err(not_found(&extension));
    }
    if !state.sip.unregister(extension.clone()).await {
        return Err(internal_msg("controller unavailable"));
    }
    Ok(Json(json!({"ok": true, "extension": extension})))
}

fn not_found(extension: &ExtensionId) -> (StatusCode, Json<Value>) {
    let err = VoxError::ExtensionNotFound {
        id: extension.to_string(),
    };
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": err.to_string(), "code": err.code()})),
    )
}

fn internal(e: vox_db::DbError) -> (StatusCode, Json<Value>) {
    warn!("device endpoint error: {e}");
    let err = VoxError::Database(e.to_string());
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error", "code": err.code()})),
    )
}

fn internal_msg(msg: &str) -> (StatusCode, Json<Value>) {
    let err = VoxError::Internal(msg.to_string());
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": msg, "code": err.code()})),
    )
}
