use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Provider error ({provider}): {reason}")]
    Provider { provider: String, reason: String },

    #[error("Call media error: {0}")]
    Media(String),

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Extension not found: {id}")]
    ExtensionNotFound { id: String },

    #[error("Room already claimed by {holder}")]
    RoomClaimed { holder: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VoxError {
    /// Short error code string used in HTTP error payloads and events.
    pub fn code(&self) -> &'static str {
        match self {
            VoxError::Config(_) => "CONFIG_ERROR",
            VoxError::Database(_) => "DATABASE_ERROR",
            VoxError::Broker(_) => "BROKER_ERROR",
            VoxError::Provider { .. } => "PROVIDER_ERROR",
            VoxError::Media(_) => "MEDIA_ERROR",
            VoxError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            VoxError::ExtensionNotFound { .. } => "EXTENSION_NOT_FOUND",
            VoxError::RoomClaimed { .. } => "ROOM_CLAIMED",
            VoxError::Serialization(_) => "SERIALIZATION_ERROR",
            VoxError::Io(_) => "IO_ERROR",
            VoxError::Timeout { .. } => "TIMEOUT",
            VoxError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, VoxError>;
