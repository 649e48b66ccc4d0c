use thiserror::Error;

use crate::types::ApprovalStatus;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown callback token")]
    UnknownToken,

    #[error("already {status}")]
    AlreadyDecided { status: ApprovalStatus },

    #[error("approval expired")]
    Expired,

    #[error("KV error: {0}")]
    Kv(#[from] courier_kv::KvError),

    #[error("queue error: {0}")]
    Queue(#[from] courier_queue::QueueError),

    /// Audit append failed for a security-critical event. Fatal for the
    /// caller.
    #[error("audit append failed: {0}")]
    Audit(#[from] courier_audit::AuditError),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;
