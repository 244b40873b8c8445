use serde::{Deserialize, Serialize};
use serde_json::Value;

use vox_core::types::{
    AgentConfigId, CallId, ConversationId, ConversationStatus, DeviceStatus, ExtensionId,
    MessageRole,
};

/// One provider slot on an agent config: name-keyed provider plus an opaque
/// options map handed to the adapter untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub provider: String,
    #[serde(default)]
    pub options: Value,
}

/// An AI persona: instructions, providers, webhooks.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub id: AgentConfigId,
    pub name: String,
    pub llm: ProviderSpec,
    pub stt: ProviderSpec,
    pub tts: ProviderSpec,
    pub system_prompt: String,
    /// Raw TTS extras (voice profile id, speed) kept verbatim.
    pub tts_extras: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// A registered softphone identity delegating to one agent.
#[derive(Debug, Clone)]
pub struct SipDevice {
    pub id: ExtensionId,
    pub agent_config_id: AgentConfigId,
    pub server: String,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub transport: String,
    pub display_name: Option<String>,
    pub realm: Option<String>,
    pub outbound_proxy: Option<String>,
    pub greeting_text: Option<String>,
    pub status: DeviceStatus,
    pub last_error: Option<String>,
    pub registered_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub agent_config_id: AgentConfigId,
    pub session_id: String,
    pub status: ConversationStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CallLog {
    pub id: String,
    pub sip_device_id: ExtensionId,
    pub call_id: CallId,
    pub direction: String,
    pub remote_uri: Option<String>,
    pub remote_name: Option<String>,
    pub livekit_room: Option<String>,
    pub status: String,
    pub started_at: String,
    pub answered_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_secs: Option<i64>,
}

/// One embedded chunk of an agent's knowledge document. Read-only at
/// session time.
#[derive(Debug, Clone)]
pub struct KnowledgeChunk {
    pub id: String,
    pub agent_config_id: AgentConfigId,
    pub filename: String,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct WebhookEndpoint {
    pub id: String,
    pub agent_config_id: AgentConfigId,
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: Value,
    pub secret: Option<String>,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct VoiceProfile {
    pub id: String,
    pub reference_audio_url: String,
}

#[derive(Debug, Clone)]
pub struct AgentLesson {
    pub id: String,
    pub agent_config_id: AgentConfigId,
    pub improved_instruction: String,
    pub status: String,
    pub created_at: String,
}

/// Per-agent guardian tuning. Keyword lists are JSON string arrays.
#[derive(Debug, Clone)]
pub struct GuardianConfigRow {
    pub agent_config_id: AgentConfigId,
    pub critical_keywords: Vec<String>,
    pub high_risk_keywords: Vec<String>,
    pub medium_risk_keywords: Vec<String>,
    pub auto_handoff_threshold: f64,
    pub enabled: bool,
}
