use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who caused an audited event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AuditActor {
    User(String),
    System(String),
}

impl AuditActor {
    pub fn user(id: impl fmt::Display) -> Self {
        AuditActor::User(id.to_string())
    }

    pub fn system(component: impl Into<String>) -> Self {
        AuditActor::System(component.into())
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            AuditActor::User(_) => "user",
            AuditActor::System(_) => "system",
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            AuditActor::User(id) | AuditActor::System(id) => id,
        }
    }
}

/// One row of the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub actor_type: String,
    pub actor_id: String,
    pub event_type: String,
    pub metadata: serde_json::Value,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// SHA-256 over the canonical encoding of
    /// `{previousHash, eventType, metadata, createdAtIso}`.
    pub hash_chain: String,
}
