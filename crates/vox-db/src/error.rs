use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Row not found: {table}/{id}")]
    NotFound { table: &'static str, id: String },

    #[error("Malformed column: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
