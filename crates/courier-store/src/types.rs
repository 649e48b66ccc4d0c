use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use courier_core::types::{MessagePart, Role};

/// Lifecycle of a persisted platform update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    /// Durably inserted, not yet on the work queue.
    Received,
    /// Handed to the updates queue.
    Enqueued,
    /// Worker finished successfully. Terminal.
    Processed,
    /// Worker gave up. Terminal.
    Failed,
}

impl UpdateStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdateStatus::Processed | UpdateStatus::Failed)
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateStatus::Received => "received",
            UpdateStatus::Enqueued => "enqueued",
            UpdateStatus::Processed => "processed",
            UpdateStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for UpdateStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "received" => Ok(UpdateStatus::Received),
            "enqueued" => Ok(UpdateStatus::Enqueued),
            "processed" => Ok(UpdateStatus::Processed),
            "failed" => Ok(UpdateStatus::Failed),
            other => Err(format!("unknown update status: {other}")),
        }
    }
}

/// Idempotency record for one inbound transport event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedUpdate {
    pub update_id: i64,
    pub payload: serde_json::Value,
    pub status: UpdateStatus,
    pub received_at: DateTime<Utc>,
    pub handled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A conversation thread scoped by (chat, user, optional thread).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub chat_id: i64,
    pub user_id: i64,
    pub thread_id: Option<i64>,
    /// Opaque scratch space (wallet-link flow state lives here).
    pub state: serde_json::Value,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One persisted message in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
