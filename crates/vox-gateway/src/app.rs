use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use vox_broker::Broker;
use vox_core::config::VoxConfig;
use vox_db::Database;
use vox_guardian::GuardianSupervisor;
use vox_sip::SipControllerHandle;
use vox_webrtc::BrokerClaimService;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: VoxConfig,
    pub db: Arc<Database>,
    pub broker: Arc<dyn Broker>,
    pub supervisor: Arc<GuardianSupervisor>,
    pub sip: SipControllerHandle,
    pub claims: Arc<BrokerClaimService>,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/devices", get(crate::http::devices::list_devices))
        .route(
            "/devices/{id}/register",
            post(crate::http::devices::register_device),
        )
        .route(
            "/devices/{id}/unregister",
            post(crate::http::devices::unregister_device),
        )
        .route("/calls", get(crate::http::calls::list_calls))
        .route(
            "/claim-room",
            post(crate::http::claim::claim_room).delete(crate::http::claim::release_room),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
