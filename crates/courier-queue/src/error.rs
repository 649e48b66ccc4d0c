use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {id}")]
    JobNotFound { id: String },

    #[error("unknown queue: {name}")]
    UnknownQueue { name: String },
}

pub type Result<T> = std::result::Result<T, QueueError>;
