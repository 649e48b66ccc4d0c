use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an approval. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Requested,
    Approved,
    Denied,
    Expired,
    Failed,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Requested)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Requested => "requested",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "requested" => Ok(ApprovalStatus::Requested),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            "expired" => Ok(ApprovalStatus::Expired),
            "failed" => Ok(ApprovalStatus::Failed),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// The user's choice on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Deny,
}

impl DecisionKind {
    pub fn terminal_status(self) -> ApprovalStatus {
        match self {
            DecisionKind::Approve => ApprovalStatus::Approved,
            DecisionKind::Deny => ApprovalStatus::Denied,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Approve => "approve",
            DecisionKind::Deny => "deny",
        }
    }
}

/// Assessed severity of a tool call. Ordered: Low < Medium < High < Critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// One level up, saturating at Critical.
    pub fn raise(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    /// One level down, saturating at Low.
    pub fn lower(self) -> Self {
        match self {
            RiskLevel::Critical => RiskLevel::High,
            RiskLevel::High => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// How sure the walker is about its value/gas extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskConfidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskConfidence::Low => "low",
            RiskConfidence::Medium => "medium",
            RiskConfidence::High => "high",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RiskConfidence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskConfidence::Low),
            "medium" => Ok(RiskConfidence::Medium),
            "high" => Ok(RiskConfidence::High),
            other => Err(format!("unknown risk confidence: {other}")),
        }
    }
}

/// A persisted approval gate for one sensitive tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    /// Server-issued id, stable across the turn (`apr_` + uuid).
    pub approval_id: String,
    /// Unguessable token embedded in keyboard callback data.
    pub callback_token: String,
    pub session_id: String,
    pub chat_id: i64,
    pub user_id: i64,
    pub correlation_id: String,
    pub tool_name: String,
    pub tool_call_id: String,
    pub tool_input: serde_json::Value,
    pub risk_level: RiskLevel,
    pub risk_confidence: RiskConfidence,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
    pub decided_by: Option<i64>,
    pub decided_at: Option<DateTime<Utc>>,
    /// Transport message id of the approval prompt, when tracked.
    pub prompt_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Approval {
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}
