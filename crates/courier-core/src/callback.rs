//! Callback-data grammar for inline-keyboard buttons.
//!
//! Three namespaces: `ap:<token>:<verb>` for approvals,
//! `cfg:<section>:<target>:<value>` for settings chips, and
//! `wallet:<verb>:<session_id>` for the wallet-link flow.
//! Any other payload is ignored by the router.

/// Verb on an approval prompt button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalVerb {
    Approve,
    Deny,
    Details,
    Refresh,
}

/// Verb on a wallet-flow button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletVerb {
    Status,
    Cancel,
}

/// A parsed callback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Approval {
        token: String,
        verb: ApprovalVerb,
    },
    Settings {
        section: String,
        target: String,
        value: String,
    },
    Wallet {
        verb: WalletVerb,
        session_id: String,
    },
}

/// Parse callback data. Returns `None` for anything outside the grammar:
/// unknown payloads are dropped silently, never an error.
pub fn parse(data: &str) -> Option<CallbackAction> {
    let mut parts = data.splitn(2, ':');
    let namespace = parts.next()?;
    let rest = parts.next()?;

    match namespace {
        "ap" => {
            let (token, verb) = rest.rsplit_once(':')?;
            if token.is_empty() {
                return None;
            }
            let verb = match verb {
                "approve" => ApprovalVerb::Approve,
                "deny" => ApprovalVerb::Deny,
                "details" => ApprovalVerb::Details,
                "refresh" => ApprovalVerb::Refresh,
                _ => return None,
            };
            Some(CallbackAction::Approval {
                token: token.to_string(),
                verb,
            })
        }
        "cfg" => {
            let mut fields = rest.splitn(3, ':');
            let section = fields.next()?;
            let target = fields.next()?;
            let value = fields.next()?;
            if section.is_empty() || target.is_empty() {
                return None;
            }
            Some(CallbackAction::Settings {
                section: section.to_string(),
                target: target.to_string(),
                value: value.to_string(),
            })
        }
        "wallet" => {
            let (verb, session_id) = rest.split_once(':')?;
            let verb = match verb {
                "status" => WalletVerb::Status,
                "cancel" => WalletVerb::Cancel,
                _ => return None,
            };
            if session_id.is_empty() {
                return None;
            }
            Some(CallbackAction::Wallet {
                verb,
                session_id: session_id.to_string(),
            })
        }
        _ => None,
    }
}

/// Render the approval callback payload for a keyboard button.
pub fn approval_data(token: &str, verb: ApprovalVerb) -> String {
    let verb = match verb {
        ApprovalVerb::Approve => "approve",
        ApprovalVerb::Deny => "deny",
        ApprovalVerb::Details => "details",
        ApprovalVerb::Refresh => "refresh",
    };
    format!("ap:{token}:{verb}")
}
