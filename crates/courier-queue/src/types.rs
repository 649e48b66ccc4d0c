use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Queue names used across the runtime.
pub const QUEUE_UPDATES: &str = "updates";
pub const QUEUE_AGENT_TURNS: &str = "agent-turns";
pub const QUEUE_APPROVAL_TIMEOUTS: &str = "approval-timeouts";
pub const QUEUE_APPROVAL_COUNTDOWNS: &str = "approval-countdowns";
pub const QUEUE_DEAD_LETTER: &str = "retry-deadletter";

/// Static definition of a queue: retry budget and worker cap.
#[derive(Debug, Clone, Copy)]
pub struct QueueSpec {
    pub name: &'static str,
    pub max_attempts: u32,
    pub concurrency: usize,
}

/// All queues the runtime operates, with their caps.
pub const QUEUES: &[QueueSpec] = &[
    QueueSpec {
        name: QUEUE_UPDATES,
        max_attempts: 5,
        concurrency: 20,
    },
    QueueSpec {
        name: QUEUE_AGENT_TURNS,
        max_attempts: 5,
        concurrency: 12,
    },
    QueueSpec {
        name: QUEUE_APPROVAL_TIMEOUTS,
        max_attempts: 1,
        concurrency: 5,
    },
    QueueSpec {
        name: QUEUE_APPROVAL_COUNTDOWNS,
        max_attempts: 1,
        concurrency: 5,
    },
    QueueSpec {
        name: QUEUE_DEAD_LETTER,
        max_attempts: 1,
        concurrency: 2,
    },
];

pub fn queue_spec(name: &str) -> Option<&'static QueueSpec> {
    QUEUES.iter().find(|q| q.name == name)
}

/// A claimed job handed to a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Delivery attempts made so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A job that exhausted its retry budget, parked for investigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub job_id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub correlation_id: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}
