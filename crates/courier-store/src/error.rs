use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("update not found: {update_id}")]
    UpdateNotFound { update_id: i64 },
}

pub type Result<T> = std::result::Result<T, StoreError>;
