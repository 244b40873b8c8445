//! WebRTC agent worker: dispatch claiming, room sessions, in-band guardian
//! commands, and the worker heartbeat.
//!
//! The SFU itself is an external collaborator — this crate talks to it
//! through the [`room`] contract traits. The one hard invariant lives in
//! [`claim`]: at most one worker per room, enforced by a TTL'd claim record
//! written before the room is ever joined.

pub mod claim;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod room;

pub use claim::{BrokerClaimService, ClaimOutcome, ClaimService, RoomClaimClient};
pub use controller::{AgentSessionController, Dispatch, DispatchOutcome};
pub use error::{Result, WebrtcError};
pub use room::{AudioPublisher, RoomClient, RoomEvent, RoomSession};
