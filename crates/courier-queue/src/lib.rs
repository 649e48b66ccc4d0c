pub mod db;
pub mod engine;
pub mod error;
pub mod store;
pub mod types;

pub use engine::{JobHandler, QueueEngine};
pub use error::{QueueError, Result};
pub use store::{EnqueueOutcome, QueueStore};
pub use types::{DeadLetter, Job, QueueSpec};
