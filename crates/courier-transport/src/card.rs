//! Rendering for approval prompts and related notices.

use courier_approvals::{Approval, RiskLevel};
use courier_core::callback::{approval_data, ApprovalVerb};

use crate::types::{Button, InlineKeyboard};

/// The pending-approval card, re-rendered by the countdown worker with the
/// remaining time.
pub fn render_approval_card(approval: &Approval, remaining_secs: i64) -> String {
    let mut out = String::new();
    out.push_str("Approval required\n\n");
    out.push_str(&format!("Tool: {}\n", approval.tool_name));
    out.push_str(&format!("Risk: {}", approval.risk_level));
    if matches!(approval.risk_level, RiskLevel::High | RiskLevel::Critical) {
        out.push_str(" ⚠");
    }
    out.push('\n');

    let minutes = remaining_secs / 60;
    let seconds = remaining_secs % 60;
    out.push_str(&format!("Expires in {minutes}:{seconds:02}\n"));
    out.push_str("\nReview the action and decide below.");
    out
}

pub fn approval_keyboard(approval: &Approval) -> InlineKeyboard {
    InlineKeyboard {
        rows: vec![
            vec![
                Button {
                    text: "✅ Approve".into(),
                    callback_data: approval_data(&approval.callback_token, ApprovalVerb::Approve),
                },
                Button {
                    text: "❌ Deny".into(),
                    callback_data: approval_data(&approval.callback_token, ApprovalVerb::Deny),
                },
            ],
            vec![Button {
                text: "Details".into(),
                callback_data: approval_data(&approval.callback_token, ApprovalVerb::Details),
            }],
        ],
    }
}

/// Detail view behind the Details button.
pub fn render_approval_details(approval: &Approval) -> String {
    let input = serde_json::to_string_pretty(&approval.tool_input)
        .unwrap_or_else(|_| approval.tool_input.to_string());
    format!(
        "Tool: {}\nRisk: {} (confidence: {})\n\nInput:\n{}",
        approval.tool_name, approval.risk_level, approval.risk_confidence, input
    )
}

pub fn render_expired_card(approval: &Approval) -> String {
    format!(
        "Approval expired\n\nThe pending {} action was not decided in time and has been cancelled.",
        approval.tool_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_approvals::{ApprovalStatus, RiskConfidence};

    fn approval() -> Approval {
        Approval {
            approval_id: "apr_1".into(),
            callback_token: "tok_abcdef123456".into(),
            session_id: "sess".into(),
            chat_id: 1,
            user_id: 2,
            correlation_id: "corr".into(),
            tool_name: "sendMessage".into(),
            tool_call_id: "call_1".into(),
            tool_input: serde_json::json!({"amount": 2.5}),
            risk_level: RiskLevel::High,
            risk_confidence: RiskConfidence::Medium,
            status: ApprovalStatus::Requested,
            expires_at: Utc::now(),
            decided_by: None,
            decided_at: None,
            prompt_message_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn card_shows_tool_and_countdown() {
        let card = render_approval_card(&approval(), 95);
        assert!(card.contains("sendMessage"));
        assert!(card.contains("1:35"));
        assert!(card.contains("high"));
    }

    #[test]
    fn keyboard_encodes_callback_token() {
        let kb = approval_keyboard(&approval());
        assert_eq!(kb.rows[0][0].callback_data, "ap:tok_abcdef123456:approve");
        assert_eq!(kb.rows[0][1].callback_data, "ap:tok_abcdef123456:deny");
    }

    #[test]
    fn details_include_input_json() {
        let details = render_approval_details(&approval());
        assert!(details.contains("amount"));
        assert!(details.contains("2.5"));
    }
}
