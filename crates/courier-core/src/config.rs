use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// Hard limits shared across the runtime.
pub const TRANSPORT_MESSAGE_MAX: usize = 4096; // chat platform per-message cap
pub const DRAFT_MIN_INTERVAL_MS: u64 = 180; // minimum gap between draft sends
pub const APPROVAL_TTL_SECS: i64 = 300; // pending approvals expire after 5 min
pub const APPROVAL_COUNTDOWN_SECS: i64 = 30; // pending-card refresh cadence
pub const TOOL_TIMEOUT_SECS: u64 = 20; // per-tool execution budget
pub const RECOVERY_SWEEP_INTERVAL_SECS: u64 = 5;
pub const RECOVERY_SWEEP_BATCH: usize = 200;
pub const HISTORY_LOAD_LIMIT: usize = 80; // messages replayed to the LLM

/// Top-level config (courier.toml + COURIER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub transport: TransportConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// How updates are pulled from the chat platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Webhook,
    Polling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bot token for the chat platform client.
    pub token: String,
    /// Secret expected in X-Courier-Secret-Token and/or the webhook URL segment.
    pub webhook_secret: Option<String>,
    /// Bearer token protecting /internal/* endpoints.
    pub admin_token: Option<String>,
    #[serde(default = "default_run_mode")]
    pub mode: RunMode,
    /// Externally reachable base URL; the webhook is registered against it
    /// at boot in webhook mode.
    pub public_url: Option<String>,
    /// Override for the platform API host (tests, self-hosted relays).
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Primary model id for agent turns.
    pub primary: String,
    /// Optional fallback model tried when the primary fails pre-stream.
    pub fallback: Option<String>,
    /// Optional cheap model for topic naming.
    pub topic_naming: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,
    #[serde(default = "default_chat_minute_max")]
    pub chat_minute_max: u64,
    #[serde(default = "default_free_burst_max")]
    pub free_burst_max: u64,
    #[serde(default = "default_free_minute_max")]
    pub free_minute_max: u64,
    #[serde(default = "default_free_daily_max")]
    pub free_daily_max: u64,
    #[serde(default = "default_trusted_multiplier")]
    pub trusted_multiplier: u64,
    #[serde(default = "default_notice_cooldown_secs")]
    pub notice_cooldown_secs: u64,
    /// Comma-separated user ids that receive the trusted multiplier.
    #[serde(default)]
    pub trusted_user_ids: String,
    #[serde(default = "default_daily_grace_secs")]
    pub daily_grace_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            burst_window_secs: default_burst_window_secs(),
            chat_minute_max: default_chat_minute_max(),
            free_burst_max: default_free_burst_max(),
            free_minute_max: default_free_minute_max(),
            free_daily_max: default_free_daily_max(),
            trusted_multiplier: default_trusted_multiplier(),
            notice_cooldown_secs: default_notice_cooldown_secs(),
            trusted_user_ids: String::new(),
            daily_grace_secs: default_daily_grace_secs(),
        }
    }
}

impl LimitsConfig {
    /// Parse the CSV trusted-user list. Malformed entries are skipped.
    pub fn trusted_ids(&self) -> HashSet<i64> {
        self.trusted_user_ids
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "bool_true")]
    pub streaming_drafts: bool,
    #[serde(default)]
    pub topic_auto_create: bool,
    #[serde(default = "bool_true")]
    pub approval_ux: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            streaming_drafts: true,
            topic_auto_create: false,
            approval_ux: true,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8780
}
fn default_run_mode() -> RunMode {
    RunMode::Webhook
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.courier/courier.db")
}
fn default_burst_window_secs() -> u64 {
    3
}
fn default_chat_minute_max() -> u64 {
    20
}
fn default_free_burst_max() -> u64 {
    3
}
fn default_free_minute_max() -> u64 {
    15
}
fn default_free_daily_max() -> u64 {
    300
}
fn default_trusted_multiplier() -> u64 {
    5
}
fn default_notice_cooldown_secs() -> u64 {
    20
}
fn default_daily_grace_secs() -> u64 {
    300
}

impl CourierConfig {
    /// Load config from a TOML file with COURIER_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.courier/courier.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CourierConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("COURIER_").split("_"))
            .extract()
            .map_err(|e| crate::error::CourierError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot safely start with.
    /// A failure here is fatal at boot.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.transport.token.trim().is_empty() {
            return Err(crate::error::CourierError::Config(
                "transport.token must not be empty".into(),
            ));
        }
        if self.models.primary.trim().is_empty() {
            return Err(crate::error::CourierError::Config(
                "models.primary must not be empty".into(),
            ));
        }
        if self.transport.mode == RunMode::Webhook && self.transport.webhook_secret.is_none() {
            tracing::warn!("webhook mode without a webhook secret: endpoint is unauthenticated");
        }
        if self.limits.free_burst_max == 0 || self.limits.free_minute_max == 0 {
            return Err(crate::error::CourierError::Config(
                "rate limit maxima must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.courier/courier.toml")
}
