pub mod error;
pub mod lock;
pub mod store;
pub mod token;

pub use error::{KvError, Result};
pub use lock::{ChatLockGuard, LockError};
pub use store::{Counter, KvStore, MemoryKv};
