//! Channel names and key formats. Every process that talks to the fabric
//! goes through these; a typo'd channel string is a silent black hole.

use vox_core::types::{ConversationId, RoomName};

/// External → SIP controller: dynamic extension registration.
pub const CH_SIP_REGISTER: &str = "sip-bridge:register";
/// External → SIP controller: dynamic extension removal.
pub const CH_SIP_UNREGISTER: &str = "sip-bridge:unregister";
/// Controllers → external: typed guardian events (dashboard feed).
pub const CH_GUARDIAN_EVENTS: &str = "guardian:events";
/// External → controllers: operator takeover/release commands.
pub const CH_GUARDIAN_TAKEOVER: &str = "guardian:takeover";
/// Controllers → external: operational alerts.
pub const CH_GUARDIAN_ALERTS: &str = "guardian:alerts";

/// Worker liveness key (TTL 30 s, refreshed every 10 s).
pub const KEY_WORKER_HEARTBEAT: &str = "worker:heartbeat";

/// Fencing lock held while a takeover/release callback runs.
pub fn takeover_lock_key(conversation: &ConversationId) -> String {
    format!("takeoverLock:{}", conversation)
}

/// At-most-one-worker-per-room claim record.
pub fn room_claim_key(room: &RoomName) -> String {
    format!("RoomClaim:{}", room)
}
