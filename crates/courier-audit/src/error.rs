use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("chain broken at row {id}: stored {stored}, recomputed {recomputed}")]
    ChainBroken {
        id: i64,
        stored: String,
        recomputed: String,
    },
}

pub type Result<T> = std::result::Result<T, AuditError>;
