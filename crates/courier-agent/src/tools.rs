//! Tool interface for the agent loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::ToolDefinition;

/// Classification driving the policy wrapper: what may run where, what is
/// cached, and what needs human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Safe to run anywhere and to cache briefly.
    ReadOnly,
    /// Mutates external state. Never cached.
    Write,
    /// Value-moving writes. Never cached, always approval-gated.
    CriticalWrite,
    /// Expensive computation. Never cached; approval-gated for large inputs.
    Compute,
    /// Key generation, signing. Never exposed to the model.
    Secrets,
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Structured output returned to the LLM.
    pub output: serde_json::Value,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            output,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: serde_json::json!({ "error": message.into() }),
            is_error: true,
        }
    }
}

/// Trait that all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "getBalance").
    fn name(&self) -> &str;
    /// Human-readable description advertised to the model.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Policy classification.
    fn kind(&self) -> ToolKind;
    /// Whether this specific call requires human approval. The policy
    /// wrapper extends this with kind- and size-based rules.
    fn needs_approval(&self, _input: &serde_json::Value) -> bool {
        false
    }
    /// Execute the tool with the given input.
    async fn execute(&self, input: serde_json::Value) -> ToolOutcome;
}

/// Convert a tool set to API-level definitions.
pub fn to_definitions(tools: &[std::sync::Arc<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}
