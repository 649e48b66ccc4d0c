//! Response policy: rewrites raw LLM text before it reaches the user.
//!
//! The model sometimes answers an approved callback with nothing, with a
//! fresh plain-text approval ask, or with a bare "done". All three read as
//! broken UX, so the policy replaces them with a synthesized confirmation
//! that summarizes what actually ran.

/// Summary of one executed tool, for the synthesized confirmation.
#[derive(Debug, Clone, Default)]
pub struct ToolSummary {
    pub tool_name: String,
    pub destination: Option<String>,
    pub tx_hash: Option<String>,
}

/// Everything the policy needs to know about the turn.
#[derive(Debug, Clone, Default)]
pub struct ResponseContext {
    /// The turn was triggered by an approved callback.
    pub approved_callback: bool,
    /// The user's original request text, when this was a text turn.
    pub user_request: Option<String>,
    /// Approvals still pending after this turn.
    pub pending_approvals: usize,
    /// Executed tools with extracted destination/hash.
    pub tool_summaries: Vec<ToolSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    pub text: String,
    pub forced_approved_status: bool,
    /// A plain-text re-ask (or trivial/empty reply) was suppressed.
    pub reask_blocked: bool,
}

const APPROVAL_PENDING_SUFFIX: &str =
    "Approval pending. Use the buttons above to approve or deny.";

const TRIVIAL_PHRASES: &[&str] = &[
    "done",
    "done.",
    "done!",
    "completed",
    "completed.",
    "all set",
    "all set.",
    "all set!",
    "ok",
    "okay",
    "finished",
    "finished.",
    "task complete",
    "task completed",
];

const REASK_MARKERS: &[&str] = &[
    "please approve",
    "tap approve",
    "do you approve",
    "reply yes",
    "please confirm",
    "confirm the transaction",
    "awaiting your approval",
    "need your approval",
];

pub fn apply_response_policy(raw: &str, ctx: &ResponseContext) -> PolicyOutcome {
    let trimmed = raw.trim();

    if ctx.approved_callback && (trimmed.is_empty() || is_trivial(trimmed) || is_reask(trimmed)) {
        let mut text = String::from("Approval received. Protected action executed.");
        for summary in &ctx.tool_summaries {
            if let Some(dest) = &summary.destination {
                text.push_str(&format!("\nDestination: {dest}"));
            }
            if let Some(hash) = &summary.tx_hash {
                text.push_str(&format!("\nTransaction: {hash}"));
            }
        }
        return PolicyOutcome {
            text: with_pending_suffix(text, ctx.pending_approvals),
            forced_approved_status: true,
            reask_blocked: true,
        };
    }

    if (trimmed.is_empty() || is_trivial(trimmed)) && ctx.pending_approvals == 0 {
        if let Some(request) = ctx.user_request.as_deref().filter(|r| !r.trim().is_empty()) {
            let quoted = truncate(request.trim(), 120);
            return PolicyOutcome {
                text: format!("Done. Your request \"{quoted}\" has been completed."),
                forced_approved_status: false,
                reask_blocked: false,
            };
        }
    }

    PolicyOutcome {
        text: with_pending_suffix(trimmed.to_string(), ctx.pending_approvals),
        forced_approved_status: false,
        reask_blocked: false,
    }
}

fn with_pending_suffix(text: String, pending: usize) -> String {
    if pending == 0 {
        return text;
    }
    if text.is_empty() {
        return APPROVAL_PENDING_SUFFIX.to_string();
    }
    format!("{text}\n\n{APPROVAL_PENDING_SUFFIX}")
}

fn is_trivial(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRIVIAL_PHRASES.contains(&lower.as_str())
}

fn is_reask(text: &str) -> bool {
    let lower = text.to_lowercase();
    REASK_MARKERS.iter().any(|m| lower.contains(m))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approved_ctx() -> ResponseContext {
        ResponseContext {
            approved_callback: true,
            user_request: None,
            pending_approvals: 0,
            tool_summaries: vec![ToolSummary {
                tool_name: "sendMessage".into(),
                destination: Some("EQdest".into()),
                tx_hash: Some("abc123".into()),
            }],
        }
    }

    #[test]
    fn approved_callback_empty_text_is_replaced() {
        let out = apply_response_policy("", &approved_ctx());
        assert!(out.text.starts_with("Approval received."));
        assert!(out.text.contains("EQdest"));
        assert!(out.text.contains("abc123"));
        assert!(out.forced_approved_status);
        assert!(out.reask_blocked);
    }

    #[test]
    fn approved_callback_trivial_text_is_replaced() {
        for raw in ["done", "Completed", "all set!"] {
            let out = apply_response_policy(raw, &approved_ctx());
            assert!(out.text.starts_with("Approval received."), "raw = {raw}");
            assert!(out.forced_approved_status);
        }
    }

    #[test]
    fn approved_callback_reask_is_blocked() {
        let out = apply_response_policy(
            "The transfer is ready. Please approve it to continue.",
            &approved_ctx(),
        );
        assert!(out.text.starts_with("Approval received."));
        assert!(out.reask_blocked);
    }

    #[test]
    fn approved_callback_real_answer_passes_through() {
        let out = apply_response_policy(
            "Sent 2.5 to EQdest. The transaction hash is abc123.",
            &approved_ctx(),
        );
        assert!(!out.forced_approved_status);
        assert!(out.text.starts_with("Sent 2.5"));
    }

    #[test]
    fn pending_approvals_append_suffix() {
        let ctx = ResponseContext {
            pending_approvals: 1,
            ..Default::default()
        };
        let out = apply_response_policy("I prepared the transfer.", &ctx);
        assert!(out.text.ends_with(APPROVAL_PENDING_SUFFIX));
        assert!(out.text.starts_with("I prepared the transfer."));
    }

    #[test]
    fn trivial_with_real_request_quotes_it() {
        let ctx = ResponseContext {
            approved_callback: false,
            user_request: Some("check my staking rewards".into()),
            pending_approvals: 0,
            tool_summaries: vec![],
        };
        let out = apply_response_policy("done", &ctx);
        assert!(out.text.contains("\"check my staking rewards\""));
        assert!(!out.forced_approved_status);
    }

    #[test]
    fn normal_text_unchanged() {
        let ctx = ResponseContext::default();
        let out = apply_response_policy("Your balance is 42.", &ctx);
        assert_eq!(out.text, "Your balance is 42.");
        assert!(!out.forced_approved_status);
        assert!(!out.reask_blocked);
    }
}
