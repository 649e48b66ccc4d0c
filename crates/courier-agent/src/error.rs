use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Lock acquisition exhausted its retries. A backpressure signal: the
    /// enclosing job should fail so its queue retries it.
    #[error(transparent)]
    Lock(#[from] courier_kv::LockError),

    #[error(transparent)]
    Provider(#[from] crate::provider::ProviderError),

    #[error(transparent)]
    Store(#[from] courier_store::StoreError),

    #[error(transparent)]
    Approval(#[from] courier_approvals::ApprovalError),

    #[error("audit append failed: {0}")]
    Audit(#[from] courier_audit::AuditError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
