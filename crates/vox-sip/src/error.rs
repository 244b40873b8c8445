use thiserror::Error;

#[derive(Debug, Error)]
pub enum SipError {
    #[error("SIP stack error: {0}")]
    Stack(String),

    #[error("Call media error: {0}")]
    Media(String),

    #[error("Audio error: {0}")]
    Audio(#[from] vox_audio::AudioError),

    #[error("Database error: {0}")]
    Database(#[from] vox_db::DbError),

    #[error("Provider error: {0}")]
    Provider(#[from] vox_providers::ProviderError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] vox_webrtc::WebrtcError),

    #[error("Broker error: {0}")]
    Broker(#[from] vox_broker::BrokerError),

    #[error("Extension not found: {0}")]
    ExtensionNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SipError>;
