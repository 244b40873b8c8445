//! The per-call turn engine: VAD-gated capture → STT → LLM → TTS → playback.
//!
//! One engine per active call, driven as a single task; controllers steer it
//! through a [`TurnHandle`] (mute, unmute, stop) and observe transcripts on
//! an event channel. Nothing in here touches shared session state — the
//! engine owns its media and history outright.

pub mod engine;
pub mod media;
pub mod truncate;

pub use engine::{
    TurnEngine, TurnEngineConfig, TurnEvent, TurnHandle, TurnState, FALLBACK_UTTERANCE,
};
pub use media::{CallMedia, MediaError};
pub use truncate::truncate_reply;
