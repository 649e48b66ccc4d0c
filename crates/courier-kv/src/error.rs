use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("KV backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, KvError>;
