//! System prompt assembly.
//!
//! One fixed template, parameterized by the turn's context. The approval
//! rules are explicit: the model must never ask for approval in plain text
//! because the runtime renders the real approval UI itself.

use courier_core::types::{ChatKind, ResponseStyle, RiskProfile};

#[derive(Debug, Clone)]
pub struct PromptParams {
    pub network: String,
    pub chat_kind: ChatKind,
    pub wallet_address: Option<String>,
    pub response_style: ResponseStyle,
    pub risk_profile: RiskProfile,
}

pub fn build_system_prompt(p: &PromptParams) -> String {
    let mut out = String::with_capacity(1024);

    out.push_str(
        "You are an assistant operating inside a chat platform. \
         You can call tools to read data and to perform actions on the user's behalf.\n\n",
    );

    out.push_str(&format!("Active network: {}.\n", p.network));
    match p.chat_kind {
        ChatKind::Private => out.push_str("This is a private conversation.\n"),
        ChatKind::Group => out.push_str(
            "This is a group conversation. Only read-only tools are available here.\n",
        ),
    }
    match &p.wallet_address {
        Some(addr) => out.push_str(&format!("The user's linked wallet address is {addr}.\n")),
        None => out.push_str("The user has not linked a wallet.\n"),
    }

    match p.response_style {
        ResponseStyle::Concise => {
            out.push_str("Answer concisely. Prefer short sentences over lists.\n")
        }
        ResponseStyle::Detailed => {
            out.push_str("Answer thoroughly, explaining relevant context.\n")
        }
    }
    out.push_str(&format!("The user's risk profile is {}.\n", p.risk_profile));

    out.push_str(
        "\nRules for sensitive actions:\n\
         - Actions that move value require the user's explicit approval. \
           The platform renders approval buttons automatically when you call such a tool.\n\
         - NEVER ask for approval or confirmation in plain text. \
           Do not write things like \"reply yes to confirm\" or \"please approve\". \
           Call the tool; the approval flow is handled for you.\n\
         - After an approved action completes, report the result once, without asking again.\n",
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PromptParams {
        PromptParams {
            network: "mainnet".into(),
            chat_kind: ChatKind::Private,
            wallet_address: Some("EQabc".into()),
            response_style: ResponseStyle::Concise,
            risk_profile: RiskProfile::Balanced,
        }
    }

    #[test]
    fn prompt_mentions_context() {
        let p = build_system_prompt(&params());
        assert!(p.contains("mainnet"));
        assert!(p.contains("EQabc"));
        assert!(p.contains("concisely"));
        assert!(p.contains("balanced"));
    }

    #[test]
    fn prompt_forbids_plain_text_approval() {
        let p = build_system_prompt(&params());
        assert!(p.contains("NEVER ask for approval"));
    }

    #[test]
    fn group_prompt_notes_read_only() {
        let mut pr = params();
        pr.chat_kind = ChatKind::Group;
        let p = build_system_prompt(&pr);
        assert!(p.contains("read-only tools"));
    }
}
