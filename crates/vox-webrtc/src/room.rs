//! SFU room contract. Production bindings (the LiveKit SDK) live outside
//! this workspace; controllers and the SIP bridge program against these
//! traits, and tests drive them with scripted fakes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use vox_core::types::RoomName;

use crate::error::Result;

/// Topic carrying operator takeover/release data messages.
pub const GUARDIAN_COMMAND_TOPIC: &str = "guardian_command";
/// Topic the worker publishes status updates on.
pub const GUARDIAN_STATUS_TOPIC: &str = "guardian_status";

/// Events surfaced from a connected room.
#[derive(Debug)]
pub enum RoomEvent {
    /// Remote participant audio, 48 kHz mono PCM, arbitrary chunk length.
    AudioFrame { participant: String, samples: Vec<i16> },
    /// Reliable data message on a topic.
    Data { topic: String, payload: Vec<u8> },
    ParticipantJoined { identity: String },
    ParticipantLeft { identity: String },
    Disconnected,
}

/// Entry point: connects to a named room with an identity.
#[async_trait]
pub trait RoomClient: Send + Sync {
    async fn connect(&self, room: &RoomName, identity: &str) -> Result<Box<dyn RoomSession>>;
}

/// One live room connection.
#[async_trait]
pub trait RoomSession: Send {
    /// Publish a local audio track; returns the writer for its frames.
    async fn publish_audio_track(&mut self, name: &str) -> Result<Box<dyn AudioPublisher>>;

    /// Mute and unpublish every locally-published audio track.
    async fn unpublish_all(&mut self) -> Result<()>;

    /// Send a reliable data message on a topic.
    async fn publish_data(&mut self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Take the event stream. Yields `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::Receiver<RoomEvent>>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Writer for one published audio track. Frames are 48 kHz mono PCM.
#[async_trait]
pub trait AudioPublisher: Send {
    async fn write(&mut self, samples: &[i16]) -> Result<()>;
}

/// Stand-in for deployments without an SFU binding linked; every connect
/// fails, which downgrades takeover bridging to unavailable.
pub struct UnavailableRoomClient;

#[async_trait]
impl RoomClient for UnavailableRoomClient {
    async fn connect(&self, room: &RoomName, _identity: &str) -> Result<Box<dyn RoomSession>> {
        Err(crate::error::WebrtcError::Room(format!(
            "no SFU binding configured (room {room})"
        )))
    }
}
