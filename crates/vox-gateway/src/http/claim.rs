//! Room-claim service endpoints. One write wins per room; release is a
//! compare-and-delete keyed on the claiming instance.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use vox_core::types::{AgentInstanceId, RoomName};
use vox_webrtc::ClaimService;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBody {
    room_name: String,
    agent_id: String,
}

/// POST /claim-room
pub async fn claim_room(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClaimBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let outcome = state
        .claims
        .claim(
            &RoomName::from(body.room_name),
            &AgentInstanceId::from(body.agent_id),
        )
        .await
        .map_err(service_error)?;

    let mut response = json!({ "claimed": outcome.claimed });
    if let Some(holder) = outcome.existing_agent_id {
        response["existingAgentId"] = json!(holder);
    }
    Ok(Json(response))
}

/// DELETE /claim-room
pub async fn release_room(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClaimBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .claims
        .release(
            &RoomName::from(body.room_name),
            &AgentInstanceId::from(body.agent_id),
        )
        .await
        .map_err(service_error)?;
    Ok(Json(json!({"ok": true})))
}

fn service_error(e: vox_webrtc::WebrtcError) -> (StatusCode, Json<Value>) {
    warn!("claim service error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "claim service unavailable"})),
    )
}
