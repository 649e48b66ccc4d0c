//! Tool policy wrapping.
//!
//! Before the catalog reaches the model: secrets tools are dropped, group
//! chats lose everything but read-only tools, and each surviving tool is
//! wrapped with a 20 s execution timeout, a 30 s read-only result cache,
//! and the approval rules for critical writes and oversized compute.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use courier_audit::chain::canonical_json;
use courier_core::config::TOOL_TIMEOUT_SECS;
use courier_core::types::ChatKind;

use crate::tools::{Tool, ToolKind, ToolOutcome};

/// Read-only results are reused for this long.
const CACHE_TTL: Duration = Duration::from_secs(30);

/// Compute inputs at or above this JSON size force approval.
const COMPUTE_APPROVAL_BYTES: usize = 6_000;

/// Filter the raw catalog for a chat and wrap every survivor.
pub fn apply_policy(tools: &[Arc<dyn Tool>], chat_kind: ChatKind) -> Vec<Arc<dyn Tool>> {
    tools
        .iter()
        .filter(|t| t.kind() != ToolKind::Secrets)
        .filter(|t| chat_kind == ChatKind::Private || t.kind() == ToolKind::ReadOnly)
        .map(|t| policy_wrap(Arc::clone(t)))
        .collect()
}

/// Wrap one tool with timeout, cache, and approval rules.
pub fn policy_wrap(inner: Arc<dyn Tool>) -> Arc<dyn Tool> {
    Arc::new(PolicyTool {
        inner,
        cache: DashMap::new(),
    })
}

struct PolicyTool {
    inner: Arc<dyn Tool>,
    cache: DashMap<String, (Instant, ToolOutcome)>,
}

#[async_trait]
impl Tool for PolicyTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_schema(&self) -> serde_json::Value {
        self.inner.input_schema()
    }

    fn kind(&self) -> ToolKind {
        self.inner.kind()
    }

    fn needs_approval(&self, input: &serde_json::Value) -> bool {
        if self.inner.needs_approval(input) {
            return true;
        }
        match self.inner.kind() {
            ToolKind::CriticalWrite => true,
            ToolKind::Compute => canonical_json(input).len() >= COMPUTE_APPROVAL_BYTES,
            _ => false,
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        let cacheable = self.inner.kind() == ToolKind::ReadOnly;
        let key = format!("{}:{}", self.inner.name(), canonical_json(&input));

        if cacheable {
            if let Some(entry) = self.cache.get(&key) {
                let (stored_at, outcome) = entry.value();
                if stored_at.elapsed() < CACHE_TTL {
                    debug!(tool = self.inner.name(), "tool cache hit");
                    return outcome.clone();
                }
            }
        }

        let result = tokio::time::timeout(
            Duration::from_secs(TOOL_TIMEOUT_SECS),
            self.inner.execute(input),
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => ToolOutcome::error(format!(
                "tool '{}' timed out after {TOOL_TIMEOUT_SECS}s",
                self.inner.name()
            )),
        };

        if cacheable && !outcome.is_error {
            self.cache.insert(key, (Instant::now(), outcome.clone()));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTool {
        name: &'static str,
        kind: ToolKind,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeTool {
        fn new(name: &'static str, kind: ToolKind) -> Arc<Self> {
            Arc::new(Self {
                name,
                kind,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(name: &'static str, kind: ToolKind, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                kind,
                calls: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn kind(&self) -> ToolKind {
            self.kind
        }
        async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            ToolOutcome::success(serde_json::json!({"echo": input}))
        }
    }

    fn catalog() -> Vec<Arc<dyn Tool>> {
        vec![
            FakeTool::new("getBalance", ToolKind::ReadOnly),
            FakeTool::new("sendMessage", ToolKind::CriticalWrite),
            FakeTool::new("buildProof", ToolKind::Compute),
            FakeTool::new("signRaw", ToolKind::Secrets),
            FakeTool::new("writeNote", ToolKind::Write),
        ]
    }

    #[test]
    fn secrets_tools_are_always_dropped() {
        let wrapped = apply_policy(&catalog(), ChatKind::Private);
        assert!(wrapped.iter().all(|t| t.name() != "signRaw"));
        assert_eq!(wrapped.len(), 4);
    }

    #[test]
    fn group_chats_keep_only_read_only() {
        let wrapped = apply_policy(&catalog(), ChatKind::Group);
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped[0].name(), "getBalance");
    }

    #[test]
    fn critical_writes_need_approval() {
        let wrapped = policy_wrap(FakeTool::new("sendMessage", ToolKind::CriticalWrite));
        assert!(wrapped.needs_approval(&serde_json::json!({"amount": 0.1})));
    }

    #[test]
    fn compute_needs_approval_only_when_large() {
        let wrapped = policy_wrap(FakeTool::new("buildProof", ToolKind::Compute));
        assert!(!wrapped.needs_approval(&serde_json::json!({"n": 1})));
        let big = serde_json::json!({"data": "x".repeat(6_000)});
        assert!(wrapped.needs_approval(&big));
    }

    #[tokio::test]
    async fn read_only_results_are_cached() {
        let tool = FakeTool::new("getBalance", ToolKind::ReadOnly);
        let wrapped = policy_wrap(tool.clone() as Arc<dyn Tool>);
        let input = serde_json::json!({"address": "EQabc"});
        wrapped.execute(input.clone()).await;
        wrapped.execute(input.clone()).await;
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);

        // Different input misses the cache.
        wrapped.execute(serde_json::json!({"address": "EQxyz"})).await;
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn writes_are_never_cached() {
        let tool = FakeTool::new("writeNote", ToolKind::Write);
        let wrapped = policy_wrap(tool.clone() as Arc<dyn Tool>);
        let input = serde_json::json!({"note": "hi"});
        wrapped.execute(input.clone()).await;
        wrapped.execute(input).await;
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tools_time_out() {
        let tool = FakeTool::slow(
            "getBalance",
            ToolKind::ReadOnly,
            Duration::from_secs(TOOL_TIMEOUT_SECS + 10),
        );
        let wrapped = policy_wrap(tool as Arc<dyn Tool>);
        let outcome = wrapped.execute(serde_json::json!({})).await;
        assert!(outcome.is_error);
        assert!(outcome.output["error"]
            .as_str()
            .unwrap()
            .contains("timed out"));
    }
}
