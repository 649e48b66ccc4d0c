use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The given thread/topic id does not exist. Senders retry without it.
    #[error("message thread not found")]
    ThreadNotFound,

    /// Edit produced identical content. Harmless; suppressed by callers.
    #[error("message is not modified")]
    NotModified,

    /// The transport does not implement this optional capability.
    #[error("capability not supported by this transport")]
    Unsupported,

    #[error("transport API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
