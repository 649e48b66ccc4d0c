pub mod chain;
pub mod db;
pub mod error;
pub mod types;

pub use chain::AuditChain;
pub use error::{AuditError, Result};
pub use types::{AuditActor, AuditEvent};
