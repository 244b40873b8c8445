use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call extracted from the LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    /// Phone cadence wants short replies; the turn engine caps this at 100.
    pub max_tokens: u32,
    /// Tools to expose to the LLM. Empty by default.
    pub tools: Vec<ToolDefinition>,
    /// Raw JSON messages for the tool loop (overrides `messages` when set).
    /// Lets the loop carry structured tool_use / tool_result blocks that
    /// plain strings can't represent.
    pub raw_messages: Option<Vec<serde_json::Value>>,
}

/// Response from an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
    /// Tool calls requested by the LLM. Empty when no tools are called.
    pub tool_calls: Vec<ToolCall>,
}

/// Captured audio handed to STT.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// STT output.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
    pub is_final: bool,
}

/// TTS output at the provider's native sample rate; the controller resamples
/// for its wire.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Common interface for speech-to-text services.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    async fn transcribe(&self, audio: &AudioClip) -> Result<Transcription, ProviderError>;
}

/// Common interface for all LLM providers.
#[async_trait]
pub trait LlmProvider: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Common interface for text-to-speech services.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str) -> Result<Synthesis, ProviderError>;
}

/// Embedding model used by knowledge retrieval. Must match the model the
/// chunks were embedded with.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider misconfigured: {0}")]
    Misconfigured(String),

    #[error("Reference audio unavailable: {0}")]
    ReferenceAudio(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

impl ProviderError {
    /// Whether the retry helper should attempt the call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::RateLimited { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_duration() {
        let clip = AudioClip {
            samples: vec![0; 8_000],
            sample_rate: 8_000,
        };
        assert_eq!(clip.duration_ms(), 1_000);
    }

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Api {
            status: 401,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Misconfigured("no key".into()).is_retryable());
        assert!(ProviderError::RateLimited { retry_after_ms: 10 }.is_retryable());
    }
}
