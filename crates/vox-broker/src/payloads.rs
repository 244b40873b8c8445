//! Wire payloads for the fabric channels. Field names are part of the wire
//! contract shared with the operator dashboard — do not rename casually.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use vox_core::types::{AgentConfigId, ConversationId, ExtensionId, RiskLevel};

/// Operator action on `guardian:takeover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeoverCommand {
    pub conversation_id: ConversationId,
    pub command: CommandKind,
    /// Milliseconds since epoch, stamped by the originator. Together with
    /// the command kind this is the dedup key.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Takeover,
    Release,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Takeover => write!(f, "takeover"),
            CommandKind::Release => write!(f, "release"),
        }
    }
}

/// In-band data message on the `guardian_command` room topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianDataMessage {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub timestamp: i64,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl GuardianDataMessage {
    /// Dedup key: at-most-once per `(type, timestamp)`.
    pub fn dedup_key(&self) -> (CommandKind, i64) {
        (self.kind, self.timestamp)
    }
}

/// Typed event on `guardian:events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SentimentUpdate,
    RiskDetected,
    TakeoverInitiated,
    TakeoverReleased,
    SessionEnded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianEvent {
    pub event: EventKind,
    pub conversation_id: ConversationId,
    pub agent_config_id: AgentConfigId,
    pub timestamp: String,
    #[serde(default)]
    pub data: Value,
}

/// Alert envelope on `guardian:alerts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianAlert {
    pub alert: String,
    pub conversation_id: Option<ConversationId>,
    pub detail: String,
    pub timestamp: String,
}

impl GuardianAlert {
    pub fn config_load_failed(agent: &AgentConfigId, detail: impl Into<String>) -> Self {
        Self {
            alert: "config_load_failed".to_string(),
            conversation_id: None,
            detail: format!("agent {}: {}", agent, detail.into()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Risk detection payload inside a `RiskDetected` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPayload {
    pub level: RiskLevel,
    pub matched_keywords: Vec<String>,
    pub category: String,
    pub score: f64,
}

/// Dynamic extension addition on `sip-bridge:register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterExtension {
    pub extension_id: ExtensionId,
}

/// Dynamic extension removal on `sip-bridge:unregister`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterExtension {
    pub extension_id: ExtensionId,
}
