//! Update routing: callbacks, anti-flood, commands, agent turns.

use std::sync::Arc;

use tracing::{debug, info, warn};

use courier_approvals::engine::DecideOutcome;
use courier_approvals::{ApprovalError, DecisionKind};
use courier_core::callback::{parse as parse_callback, ApprovalVerb, CallbackAction, WalletVerb};
use courier_core::types::{
    new_correlation_id, ChatKind, ChatScope, TurnExecutionRequest, TurnInput,
};
use courier_limits::{is_quota_exempt_command, Decision, LimitReason};
use courier_queue::types::QUEUE_AGENT_TURNS;
use courier_store::prefs::PrefField;
use courier_store::types::ProcessedUpdate;
use courier_transport::card::{approval_keyboard, render_approval_card, render_approval_details};
use courier_transport::{edit_text_quiet, send_text_chunked, SendOptions};

use crate::app::Services;

/// Route one stored update. Rules, in order: callback queries win, then
/// the chat anti-flood gate, then quota-exempt commands, then the user
/// quota and an agent turn.
pub async fn route_update(services: &Arc<Services>, update: &ProcessedUpdate) -> anyhow::Result<()> {
    // Tie-break: a payload carrying both a callback and a message is
    // treated as a callback.
    if let Some(callback) = CallbackQuery::parse(&update.payload) {
        return handle_callback(services, &callback).await;
    }
    if let Some(message) = InboundMessage::parse(&update.payload) {
        return handle_message(services, &message).await;
    }
    debug!(update_id = update.update_id, "update carries nothing routable");
    Ok(())
}

// ── Payload views ─────────────────────────────────────────────────────────────

struct CallbackQuery {
    id: String,
    data: String,
    from_id: i64,
    chat_id: i64,
    thread_id: Option<i64>,
}

impl CallbackQuery {
    fn parse(payload: &serde_json::Value) -> Option<Self> {
        let cq = payload.get("callback_query")?;
        Some(Self {
            id: cq.get("id")?.as_str()?.to_string(),
            data: cq.get("data")?.as_str()?.to_string(),
            from_id: cq.get("from")?.get("id")?.as_i64()?,
            chat_id: cq
                .get("message")
                .and_then(|m| m.get("chat"))
                .and_then(|c| c.get("id"))
                .and_then(|v| v.as_i64())?,
            thread_id: cq
                .get("message")
                .and_then(|m| m.get("message_thread_id"))
                .and_then(|v| v.as_i64()),
        })
    }
}

struct InboundMessage {
    chat_id: i64,
    chat_kind: ChatKind,
    from_id: i64,
    thread_id: Option<i64>,
    text: String,
}

impl InboundMessage {
    fn parse(payload: &serde_json::Value) -> Option<Self> {
        let msg = payload.get("message")?;
        let chat = msg.get("chat")?;
        let chat_kind = match chat.get("type").and_then(|v| v.as_str()) {
            Some("private") => ChatKind::Private,
            Some(_) => ChatKind::Group,
            None if chat.get("id")?.as_i64()? >= 0 => ChatKind::Private,
            None => ChatKind::Group,
        };
        Some(Self {
            chat_id: chat.get("id")?.as_i64()?,
            chat_kind,
            from_id: msg.get("from")?.get("id")?.as_i64()?,
            thread_id: msg.get("message_thread_id").and_then(|v| v.as_i64()),
            text: msg.get("text").and_then(|v| v.as_str())?.to_string(),
        })
    }
}

// ── Callbacks ─────────────────────────────────────────────────────────────────

async fn handle_callback(services: &Arc<Services>, cq: &CallbackQuery) -> anyhow::Result<()> {
    let Some(action) = parse_callback(&cq.data) else {
        // Outside the grammar: ack silently and drop.
        let _ = services.transport.answer_callback(&cq.id, None).await;
        return Ok(());
    };

    match action {
        CallbackAction::Approval { token, verb } => {
            handle_approval_callback(services, cq, &token, verb).await
        }
        CallbackAction::Settings {
            section,
            target,
            value,
        } => handle_settings_callback(services, cq, &section, &target, &value).await,
        CallbackAction::Wallet { verb, session_id } => {
            handle_wallet_callback(services, cq, verb, &session_id).await
        }
    }
}

async fn handle_approval_callback(
    services: &Arc<Services>,
    cq: &CallbackQuery,
    token: &str,
    verb: ApprovalVerb,
) -> anyhow::Result<()> {
    let kind = match verb {
        ApprovalVerb::Approve => Some(DecisionKind::Approve),
        ApprovalVerb::Deny => Some(DecisionKind::Deny),
        ApprovalVerb::Details | ApprovalVerb::Refresh => None,
    };

    // Details / Refresh: read-only verbs.
    let Some(kind) = kind else {
        let Some(approval) = services.approvals.get_by_token(token)? else {
            let _ = services
                .transport
                .answer_callback(&cq.id, Some("Unknown approval."))
                .await;
            return Ok(());
        };
        match verb {
            ApprovalVerb::Details => {
                let _ = services.transport.answer_callback(&cq.id, None).await;
                send_text_chunked(
                    &services.transport,
                    cq.chat_id,
                    &render_approval_details(&approval),
                    &SendOptions::in_thread(cq.thread_id),
                )
                .await
                .ok();
            }
            ApprovalVerb::Refresh => {
                let _ = services.transport.answer_callback(&cq.id, None).await;
                if let Some((approval, remaining)) =
                    services.approvals.countdown_state(&approval.approval_id)?
                {
                    if let Some(message_id) = approval.prompt_message_id {
                        edit_text_quiet(
                            &services.transport,
                            approval.chat_id,
                            message_id,
                            &render_approval_card(&approval, remaining),
                            Some(&approval_keyboard(&approval)),
                        )
                        .await
                        .ok();
                    }
                }
            }
            _ => unreachable!(),
        }
        return Ok(());
    };

    let profile = services
        .prefs
        .effective(cq.from_id, cq.chat_id)?
        .risk_profile;

    match services
        .approvals
        .decide(token, kind, cq.from_id, profile)
        .await
    {
        Ok(DecideOutcome::Decided(approval)) => {
            let toast = match kind {
                DecisionKind::Approve => "Approved",
                DecisionKind::Deny => "Denied",
            };
            let _ = services.transport.answer_callback(&cq.id, Some(toast)).await;

            if let Some(message_id) = approval.prompt_message_id {
                let line = match kind {
                    DecisionKind::Approve => {
                        format!("✅ Approved. Executing {}.", approval.tool_name)
                    }
                    DecisionKind::Deny => format!("❌ Denied. {} cancelled.", approval.tool_name),
                };
                edit_text_quiet(&services.transport, approval.chat_id, message_id, &line, None)
                    .await
                    .ok();
            }

            enqueue_approval_follow_up(services, &approval, kind).await?;
        }
        Ok(DecideOutcome::ConfirmationRequired { window_secs }) => {
            let _ = services
                .transport
                .answer_callback(
                    &cq.id,
                    Some(&format!(
                        "High-risk action. Tap again within {window_secs} s to confirm."
                    )),
                )
                .await;
        }
        Err(ApprovalError::AlreadyDecided { status }) => {
            let _ = services
                .transport
                .answer_callback(&cq.id, Some(&format!("Already {status}.")))
                .await;
        }
        Err(ApprovalError::Expired) => {
            let _ = services
                .transport
                .answer_callback(&cq.id, Some("This approval has expired."))
                .await;
        }
        Err(ApprovalError::UnknownToken) => {
            let _ = services
                .transport
                .answer_callback(&cq.id, Some("Unknown approval."))
                .await;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// The decision re-enters the agent as a synthetic role-`tool` turn.
async fn enqueue_approval_follow_up(
    services: &Arc<Services>,
    approval: &courier_approvals::Approval,
    kind: DecisionKind,
) -> anyhow::Result<()> {
    let Some(session) = services.sessions.get_by_id(&approval.session_id)? else {
        warn!(session_id = %approval.session_id, "approval session vanished");
        return Ok(());
    };

    let prefs = services.prefs.effective(session.user_id, session.chat_id)?;
    let wallet = services.prefs.wallet_address(session.user_id)?;
    let correlation_id = new_correlation_id();
    let request = TurnExecutionRequest {
        correlation_id: correlation_id.clone(),
        session_id: session.id.clone(),
        scope: ChatScope::new(session.chat_id, session.user_id, session.thread_id),
        chat_kind: if session.chat_id < 0 {
            ChatKind::Group
        } else {
            ChatKind::Private
        },
        input: TurnInput::ApprovalResponse {
            approval_id: approval.approval_id.clone(),
            tool_call_id: approval.tool_call_id.clone(),
            tool_name: approval.tool_name.clone(),
            approved: kind == DecisionKind::Approve,
        },
        network: prefs.network,
        model: services.config.models.primary.clone(),
        fallback_model: services.config.models.fallback.clone(),
        response_style: prefs.response_style,
        risk_profile: prefs.risk_profile,
        wallet_address: wallet,
    };

    services.queue.enqueue(
        QUEUE_AGENT_TURNS,
        Some(&format!("turn-{correlation_id}")),
        &serde_json::to_value(&request)?,
        Some(&correlation_id),
    )?;
    info!(approval_id = %approval.approval_id, "approval follow-up turn enqueued");
    Ok(())
}

async fn handle_settings_callback(
    services: &Arc<Services>,
    cq: &CallbackQuery,
    section: &str,
    target: &str,
    value: &str,
) -> anyhow::Result<()> {
    let Some(field) = PrefField::parse(section) else {
        let _ = services.transport.answer_callback(&cq.id, None).await;
        return Ok(());
    };
    let valid = match field {
        PrefField::ResponseStyle => value.parse::<courier_core::types::ResponseStyle>().is_ok(),
        PrefField::RiskProfile => value.parse::<courier_core::types::RiskProfile>().is_ok(),
        PrefField::Network => matches!(value, "mainnet" | "testnet"),
    };
    if !valid {
        let _ = services
            .transport
            .answer_callback(&cq.id, Some("Invalid value."))
            .await;
        return Ok(());
    }

    match target {
        "chat" => services.prefs.set_chat_field(cq.chat_id, field, value)?,
        _ => services.prefs.set_user_field(cq.from_id, field, value)?,
    }
    let _ = services.transport.answer_callback(&cq.id, Some("Saved.")).await;
    Ok(())
}

async fn handle_wallet_callback(
    services: &Arc<Services>,
    cq: &CallbackQuery,
    verb: WalletVerb,
    session_id: &str,
) -> anyhow::Result<()> {
    let _ = services.transport.answer_callback(&cq.id, None).await;
    let Some(session) = services.sessions.get_by_id(session_id)? else {
        return Ok(());
    };

    match verb {
        WalletVerb::Status => {
            let status = session
                .state
                .get("wallet_flow")
                .and_then(|v| v.as_str())
                .unwrap_or("idle");
            send_text_chunked(
                &services.transport,
                cq.chat_id,
                &format!("Wallet link status: {status}."),
                &SendOptions::in_thread(cq.thread_id),
            )
            .await
            .ok();
        }
        WalletVerb::Cancel => {
            let mut state = session.state.clone();
            if let Some(obj) = state.as_object_mut() {
                obj.remove("wallet_flow");
            }
            services.sessions.update_state(session_id, &state)?;
            send_text_chunked(
                &services.transport,
                cq.chat_id,
                "Wallet link cancelled.",
                &SendOptions::in_thread(cq.thread_id),
            )
            .await
            .ok();
        }
    }
    Ok(())
}

// ── Messages ──────────────────────────────────────────────────────────────────

async fn handle_message(services: &Arc<Services>, msg: &InboundMessage) -> anyhow::Result<()> {
    // Anti-flood applies to everything, commands included.
    let flood = services.limiter.check_chat_flood(msg.chat_id).await;
    if !flood.allowed {
        notify_denial(services, msg, &flood).await;
        return Ok(());
    }

    if let Some(command) = parse_command(&msg.text) {
        if is_quota_exempt_command(&command) {
            return handle_command(services, msg, &command).await;
        }
    }

    let quota = services.limiter.check_user_turn(msg.from_id).await;
    if !quota.allowed {
        notify_denial(services, msg, &quota).await;
        return Ok(());
    }

    enqueue_text_turn(services, msg).await
}

/// `/cmd@botname args` → `cmd`.
fn parse_command(text: &str) -> Option<String> {
    let rest = text.trim().strip_prefix('/')?;
    let first = rest.split_whitespace().next()?;
    let name = first.split('@').next().unwrap_or(first);
    if name.is_empty() {
        return None;
    }
    Some(name.to_lowercase())
}

fn command_argument(text: &str) -> Option<&str> {
    text.trim()
        .split_whitespace()
        .nth(1)
        .filter(|s| !s.is_empty())
}

async fn handle_command(
    services: &Arc<Services>,
    msg: &InboundMessage,
    command: &str,
) -> anyhow::Result<()> {
    let reply = |text: String| {
        let transport = Arc::clone(&services.transport);
        let chat_id = msg.chat_id;
        let thread_id = msg.thread_id;
        async move {
            send_text_chunked(&transport, chat_id, &text, &SendOptions::in_thread(thread_id))
                .await
                .ok();
        }
    };

    match command {
        "start" => {
            reply(
                "Hi! Send me a message and I will help you. \
                 Sensitive actions always come back to you for approval first.\n\
                 Try /settings to tune how I answer."
                    .to_string(),
            )
            .await;
        }
        "settings" => {
            let prefs = services.prefs.effective(msg.from_id, msg.chat_id)?;
            let keyboard = crate::keyboards::settings_keyboard();
            let text = format!(
                "Settings\n\nStyle: {}\nRisk profile: {}\nNetwork: {}",
                prefs.response_style, prefs.risk_profile, prefs.network
            );
            services
                .transport
                .send_message_with_keyboard(msg.chat_id, &text, &keyboard, &SendOptions::in_thread(msg.thread_id))
                .await
                .ok();
        }
        "network" => {
            let prefs = services.prefs.effective(msg.from_id, msg.chat_id)?;
            let keyboard = crate::keyboards::network_keyboard();
            services
                .transport
                .send_message_with_keyboard(
                    msg.chat_id,
                    &format!("Current network: {}", prefs.network),
                    &keyboard,
                    &SendOptions::in_thread(msg.thread_id),
                )
                .await
                .ok();
        }
        "wallet" => {
            let session = services.sessions.get_or_create(&ChatScope::new(
                msg.chat_id,
                msg.from_id,
                msg.thread_id,
            ))?;
            match command_argument(&msg.text) {
                Some("link") => {
                    let mut state = session.state.clone();
                    if !state.is_object() {
                        state = serde_json::json!({});
                    }
                    state["wallet_flow"] = serde_json::json!("pending");
                    services.sessions.update_state(&session.id, &state)?;
                    services
                        .transport
                        .send_message_with_keyboard(
                            msg.chat_id,
                            "Wallet link started. Open your wallet app to confirm.",
                            &crate::keyboards::wallet_keyboard(&session.id),
                            &SendOptions::in_thread(msg.thread_id),
                        )
                        .await
                        .ok();
                }
                Some("cancel") => {
                    let mut state = session.state.clone();
                    if let Some(obj) = state.as_object_mut() {
                        obj.remove("wallet_flow");
                    }
                    services.sessions.update_state(&session.id, &state)?;
                    reply("Wallet link cancelled.".to_string()).await;
                }
                _ => {
                    let text = match services.prefs.wallet_address(msg.from_id)? {
                        Some(addr) => format!("Linked wallet: {addr}"),
                        None => "No wallet linked. Send /wallet link to start.".to_string(),
                    };
                    reply(text).await;
                }
            }
        }
        "cancel" => {
            let session = services.sessions.get_or_create(&ChatScope::new(
                msg.chat_id,
                msg.from_id,
                msg.thread_id,
            ))?;
            let mut state = session.state.clone();
            if let Some(obj) = state.as_object_mut() {
                obj.remove("wallet_flow");
            }
            services.sessions.update_state(&session.id, &state)?;
            reply("Cancelled.".to_string()).await;
        }
        other => {
            debug!(command = other, "unknown exempt command");
        }
    }
    Ok(())
}

async fn enqueue_text_turn(services: &Arc<Services>, msg: &InboundMessage) -> anyhow::Result<()> {
    let mut thread_id = msg.thread_id;

    // Best-effort topic auto-create for group messages outside any thread.
    if services.config.features.topic_auto_create
        && msg.chat_kind == ChatKind::Group
        && thread_id.is_none()
    {
        let name = topic_name(&msg.text);
        match services
            .transport
            .create_forum_topic(msg.chat_id, &name)
            .await
        {
            Ok(id) => thread_id = Some(id),
            Err(e) => debug!(chat_id = msg.chat_id, error = %e, "topic auto-create skipped"),
        }
    }

    let scope = ChatScope::new(msg.chat_id, msg.from_id, thread_id);
    let session = services.sessions.get_or_create(&scope)?;
    let prefs = services.prefs.effective(msg.from_id, msg.chat_id)?;
    let wallet = services.prefs.wallet_address(msg.from_id)?;
    let correlation_id = new_correlation_id();

    let request = TurnExecutionRequest {
        correlation_id: correlation_id.clone(),
        session_id: session.id,
        scope,
        chat_kind: msg.chat_kind,
        input: TurnInput::Text {
            text: msg.text.clone(),
        },
        network: prefs.network,
        model: services.config.models.primary.clone(),
        fallback_model: services.config.models.fallback.clone(),
        response_style: prefs.response_style,
        risk_profile: prefs.risk_profile,
        wallet_address: wallet,
    };

    services.queue.enqueue(
        QUEUE_AGENT_TURNS,
        Some(&format!("turn-{correlation_id}")),
        &serde_json::to_value(&request)?,
        Some(&correlation_id),
    )?;
    Ok(())
}

/// First line of the message, clipped, as a forum-topic name.
fn topic_name(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "Conversation".to_string();
    }
    let mut name: String = first_line.chars().take(32).collect();
    if first_line.chars().count() > 32 {
        name.push('…');
    }
    name
}

async fn notify_denial(services: &Arc<Services>, msg: &InboundMessage, decision: &Decision) {
    let Some(reason) = decision.reason else { return };
    if reason == LimitReason::StorageError {
        return;
    }
    if !services.limiter.should_notify(msg.from_id, reason).await {
        return;
    }

    let text = match (reason, &decision.daily) {
        (LimitReason::UserDaily, Some(daily)) => format!(
            "Daily limit reached ({}/{}). It resets at {}.",
            daily.used,
            daily.limit,
            daily.resets_at_utc.format("%H:%M UTC")
        ),
        (LimitReason::ChatMinute, _) => {
            "This chat is receiving too many messages. Please slow down.".to_string()
        }
        _ => {
            let retry = decision.retry_after_seconds.unwrap_or(1);
            format!("You're sending messages too quickly. Try again in {retry}s.")
        }
    };
    send_text_chunked(
        &services.transport,
        msg.chat_id,
        &text,
        &SendOptions::in_thread(msg.thread_id),
    )
    .await
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing_strips_bot_suffix() {
        assert_eq!(parse_command("/start@my_bot"), Some("start".into()));
        assert_eq!(parse_command("/wallet link"), Some("wallet".into()));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
    }

    #[test]
    fn command_argument_extraction() {
        assert_eq!(command_argument("/wallet link"), Some("link"));
        assert_eq!(command_argument("/wallet"), None);
    }

    #[test]
    fn topic_name_clips_long_lines() {
        let name = topic_name("what is the best way to stake my tokens this year?");
        assert!(name.chars().count() <= 33);
        assert!(name.ends_with('…'));
        assert_eq!(topic_name("  \n"), "Conversation");
    }

    #[test]
    fn callback_query_parses_payload() {
        let payload = serde_json::json!({
            "update_id": 1,
            "callback_query": {
                "id": "cbq1",
                "data": "ap:tok:approve",
                "from": {"id": 2001},
                "message": {"message_id": 9, "chat": {"id": -100}}
            }
        });
        let cq = CallbackQuery::parse(&payload).unwrap();
        assert_eq!(cq.data, "ap:tok:approve");
        assert_eq!(cq.chat_id, -100);
        assert_eq!(cq.from_id, 2001);
    }

    #[test]
    fn message_parses_chat_kind() {
        let group = serde_json::json!({
            "message": {
                "text": "hi",
                "chat": {"id": -100, "type": "supergroup"},
                "from": {"id": 1},
                "message_thread_id": 7
            }
        });
        let msg = InboundMessage::parse(&group).unwrap();
        assert_eq!(msg.chat_kind, ChatKind::Group);
        assert_eq!(msg.thread_id, Some(7));

        let private = serde_json::json!({
            "message": {"text": "hi", "chat": {"id": 55, "type": "private"}, "from": {"id": 1}}
        });
        assert_eq!(
            InboundMessage::parse(&private).unwrap().chat_kind,
            ChatKind::Private
        );
    }
}
