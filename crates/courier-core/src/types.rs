use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Scope of one conversation: a chat, the acting user, and an optional
/// forum-topic thread. Sessions and chat locks are keyed by this tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatScope {
    pub chat_id: i64,
    pub user_id: i64,
    pub thread_id: Option<i64>,
}

impl ChatScope {
    pub fn new(chat_id: i64, user_id: i64, thread_id: Option<i64>) -> Self {
        Self {
            chat_id,
            user_id,
            thread_id,
        }
    }

    /// Key for the per-conversation mutex. The user id is deliberately
    /// excluded: all turn work in one (chat, thread) is serialized.
    pub fn lock_key(&self) -> String {
        match self.thread_id {
            Some(t) => format!("lock:chat:{}:{}", self.chat_id, t),
            None => format!("lock:chat:{}", self.chat_id),
        }
    }
}

impl fmt::Display for ChatScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread_id {
            Some(t) => write!(f, "{}/{}#{}", self.chat_id, self.user_id, t),
            None => write!(f, "{}/{}", self.chat_id, self.user_id),
        }
    }
}

/// Whether the conversation is a private DM or a group chat. Group chats
/// get a reduced (read-only) tool surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
}

/// Role of a stored conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One structured piece of a conversation message.
///
/// Messages are lists of parts rather than plain strings so tool calls,
/// tool results, and the approval handshake survive persistence and can be
/// replayed to the LLM exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: serde_json::Value,
        is_error: bool,
    },
    /// Emitted instead of executing a sensitive tool; resolved by the
    /// approval engine.
    ToolApprovalRequest {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The user's decision, injected as a role-`tool` turn to resume the loop.
    ToolApprovalResponse {
        id: String,
        approved: bool,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }
}

/// Per-user default answer length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStyle {
    Concise,
    Detailed,
}

impl fmt::Display for ResponseStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStyle::Concise => write!(f, "concise"),
            ResponseStyle::Detailed => write!(f, "detailed"),
        }
    }
}

impl std::str::FromStr for ResponseStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "concise" => Ok(ResponseStyle::Concise),
            "detailed" => Ok(ResponseStyle::Detailed),
            other => Err(format!("unknown response style: {other}")),
        }
    }
}

/// How aggressively risky tool calls are gated for this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskProfile {
    Cautious,
    Balanced,
    Advanced,
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskProfile::Cautious => write!(f, "cautious"),
            RiskProfile::Balanced => write!(f, "balanced"),
            RiskProfile::Advanced => write!(f, "advanced"),
        }
    }
}

impl std::str::FromStr for RiskProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cautious" => Ok(RiskProfile::Cautious),
            "balanced" => Ok(RiskProfile::Balanced),
            "advanced" => Ok(RiskProfile::Advanced),
            other => Err(format!("unknown risk profile: {other}")),
        }
    }
}

/// Partial preference set as stored (user defaults or chat overrides).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub response_style: Option<ResponseStyle>,
    pub risk_profile: Option<RiskProfile>,
    pub network: Option<String>,
}

/// Fully resolved preferences attached to a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivePreferences {
    pub response_style: ResponseStyle,
    pub risk_profile: RiskProfile,
    pub network: String,
}

impl EffectivePreferences {
    pub const DEFAULT_NETWORK: &'static str = "mainnet";

    /// chat override ?? user default ?? system default, field by field.
    pub fn resolve(chat: &Preferences, user: &Preferences) -> Self {
        Self {
            response_style: chat
                .response_style
                .or(user.response_style)
                .unwrap_or(ResponseStyle::Concise),
            risk_profile: chat
                .risk_profile
                .or(user.risk_profile)
                .unwrap_or(RiskProfile::Balanced),
            network: chat
                .network
                .clone()
                .or_else(|| user.network.clone())
                .unwrap_or_else(|| Self::DEFAULT_NETWORK.to_string()),
        }
    }
}

/// What the turn executor is asked to process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnInput {
    /// A plain user message.
    Text { text: String },
    /// A resolved approval decision, resuming the tool loop.
    ApprovalResponse {
        approval_id: String,
        tool_call_id: String,
        tool_name: String,
        approved: bool,
    },
}

/// Everything the agent-turn worker needs, serialized as a queue payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnExecutionRequest {
    pub correlation_id: String,
    pub session_id: String,
    pub scope: ChatScope,
    pub chat_kind: ChatKind,
    pub input: TurnInput,
    pub network: String,
    pub model: String,
    pub fallback_model: Option<String>,
    pub response_style: ResponseStyle,
    pub risk_profile: RiskProfile,
    pub wallet_address: Option<String>,
}

/// Fresh opaque id correlating every event of one logical operation.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
