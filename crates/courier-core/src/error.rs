use thiserror::Error;

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("KV store error: {0}")]
    Kv(String),

    #[error("Chat lock contended for scope {scope}")]
    LockContended { scope: String },

    #[error("Rate limited: {reason}")]
    RateLimited { reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("Approval state violation: {0}")]
    ApprovalState(String),

    #[error("Audit error: {0}")]
    Audit(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Short error code string used in HTTP error bodies and dead-letter reasons.
    pub fn code(&self) -> &'static str {
        match self {
            CourierError::Config(_) => "CONFIG_ERROR",
            CourierError::Validation(_) => "VALIDATION_ERROR",
            CourierError::Database(_) => "DATABASE_ERROR",
            CourierError::Queue(_) => "QUEUE_ERROR",
            CourierError::Kv(_) => "KV_ERROR",
            CourierError::LockContended { .. } => "LOCK_CONTENDED",
            CourierError::RateLimited { .. } => "RATE_LIMITED",
            CourierError::Transport(_) => "TRANSPORT_ERROR",
            CourierError::Provider(_) => "PROVIDER_ERROR",
            CourierError::ApprovalState(_) => "APPROVAL_STATE",
            CourierError::Audit(_) => "AUDIT_ERROR",
            CourierError::Serialization(_) => "SERIALIZATION_ERROR",
            CourierError::Io(_) => "IO_ERROR",
            CourierError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// The one line shown to end users for any failure they can't act on.
pub const USER_FACING_FAILURE: &str = "I could not complete that request. Please try again.";

pub type Result<T> = std::result::Result<T, CourierError>;
