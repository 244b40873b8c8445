use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebrtcError {
    #[error("Room error: {0}")]
    Room(String),

    #[error("Claim service error: {0}")]
    Claim(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] vox_db::DbError),

    #[error("Provider error: {0}")]
    Provider(#[from] vox_providers::ProviderError),

    #[error("Broker error: {0}")]
    Broker(#[from] vox_broker::BrokerError),
}

pub type Result<T> = std::result::Result<T, WebrtcError>;
