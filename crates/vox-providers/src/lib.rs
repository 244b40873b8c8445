//! Provider registry and session factory.
//!
//! Three name-keyed registries (STT, LLM, TTS) hide concrete services behind
//! uniform contracts; the factory reads an `AgentConfig` and assembles the
//! per-session pipeline, including the cloud fallback handle used when a
//! voice-cloning TTS loses its reference audio. Provider HTTP clients are
//! per-session — a stuck connection never outlives its call.

pub mod embeddings;
pub mod factory;
pub mod kokoro;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod tts;
pub mod voxclone;
pub mod whisper;

pub use factory::{SessionFactory, SessionPipeline};
pub use provider::{
    AudioClip, ChatRequest, ChatResponse, EmbeddingProvider, LlmProvider, Message, ProviderError,
    Role, SttProvider, Synthesis, Transcription, TtsProvider, ToolCall, ToolDefinition,
};
pub use registry::{LlmRegistry, SttRegistry, TtsRegistry};
