//! Agent turn execution.
//!
//! One turn: acquire the conversation lock, replay history, stream the
//! model with the policy-wrapped tool catalog, execute or gate tool calls,
//! persist everything, and shape the final text through the response
//! policy. Provider fallback is only legal before the first text delta;
//! switching providers mid-stream would desync the draft the user is
//! already watching.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use courier_approvals::engine::{ApprovalEngine, ApprovalRequest};
use courier_approvals::Approval;
use courier_audit::{AuditActor, AuditChain};
use courier_core::config::HISTORY_LOAD_LIMIT;
use courier_core::types::{MessagePart, Role, TurnExecutionRequest, TurnInput};
use courier_kv::{ChatLockGuard, KvStore};
use courier_store::ConversationStore;

use crate::draft::DraftSink;
use crate::error::{AgentError, Result};
use crate::policy::apply_policy;
use crate::prompt::{build_system_prompt, PromptParams};
use crate::provider::{
    LlmProvider, ProviderError, ProviderMessage, ProviderRequest, StreamEvent, ToolCall,
};
use crate::respond::{apply_response_policy, PolicyOutcome, ResponseContext, ToolSummary};
use crate::tools::{to_definitions, Tool, ToolOutcome};

/// Upper bound on model rounds within one turn.
const MAX_TOOL_ROUNDS: usize = 8;
const MAX_OUTPUT_TOKENS: u32 = 4096;

pub struct TurnDeps {
    pub kv: Arc<dyn KvStore>,
    pub sessions: Arc<ConversationStore>,
    pub approvals: Arc<ApprovalEngine>,
    pub audit: Arc<AuditChain>,
    pub primary: Arc<dyn LlmProvider>,
    pub fallback: Option<Arc<dyn LlmProvider>>,
    /// Raw tool catalog; the policy wrapper is applied per turn.
    pub tools: Vec<Arc<dyn Tool>>,
}

/// What the worker surfaces after a completed turn.
#[derive(Debug)]
pub struct TurnOutcome {
    pub text: String,
    pub forced_approved_status: bool,
    pub registered_approvals: Vec<Approval>,
}

pub struct TurnExecutor {
    deps: TurnDeps,
}

impl TurnExecutor {
    pub fn new(deps: TurnDeps) -> Self {
        Self { deps }
    }

    /// Run one turn end to end. Lock contention surfaces as an error so
    /// the enclosing queue job retries. Backpressure, not a user error.
    #[instrument(skip(self, req, draft), fields(correlation_id = %req.correlation_id))]
    pub async fn execute(
        &self,
        req: &TurnExecutionRequest,
        draft: &dyn DraftSink,
    ) -> Result<TurnOutcome> {
        let lock =
            ChatLockGuard::acquire(Arc::clone(&self.deps.kv), &req.scope.lock_key()).await?;
        let result = self.run_locked(req, draft).await;
        lock.release().await;
        result
    }

    async fn run_locked(
        &self,
        req: &TurnExecutionRequest,
        draft: &dyn DraftSink,
    ) -> Result<TurnOutcome> {
        let system = build_system_prompt(&PromptParams {
            network: req.network.clone(),
            chat_kind: req.chat_kind,
            wallet_address: req.wallet_address.clone(),
            response_style: req.response_style,
            risk_profile: req.risk_profile,
        });

        let tools = apply_policy(&self.deps.tools, req.chat_kind);
        let tool_defs = to_definitions(&tools);

        // Replay history, then persist and append the incoming message.
        let mut convo: Vec<ProviderMessage> = self
            .deps
            .sessions
            .load_recent(&req.session_id, HISTORY_LOAD_LIMIT)?
            .into_iter()
            .map(|m| ProviderMessage {
                role: m.role,
                parts: m.parts,
            })
            .collect();

        let mut tool_summaries: Vec<ToolSummary> = Vec::new();

        let (in_role, mut in_parts) = incoming_message(&req.input);
        // An approved decision executes the originally gated call right
        // here, before the model resumes. The model only summarizes.
        if let TurnInput::ApprovalResponse {
            approved: true,
            tool_call_id,
            tool_name,
            ..
        } = &req.input
        {
            if let Some(input) = find_gated_input(&convo, tool_call_id) {
                let call = ToolCall {
                    id: tool_call_id.clone(),
                    name: tool_name.clone(),
                    input,
                };
                let outcome = execute_tool(&tools, &call).await;
                tool_summaries.push(summarize_tool(tool_name, &outcome));
                in_parts.push(MessagePart::ToolResult {
                    id: tool_call_id.clone(),
                    name: tool_name.clone(),
                    output: outcome.output,
                    is_error: outcome.is_error,
                });
            } else {
                warn!(%tool_call_id, "approved call not found in history");
            }
        }
        self.deps
            .sessions
            .append_message(&req.session_id, in_role, &in_parts, &req.correlation_id)?;
        convo.push(ProviderMessage {
            role: in_role,
            parts: in_parts,
        });

        // Attempt order: primary, then the configured fallback.
        let mut attempts: Vec<(Arc<dyn LlmProvider>, String)> =
            vec![(Arc::clone(&self.deps.primary), req.model.clone())];
        if let Some(fallback) = &self.deps.fallback {
            attempts.push((
                Arc::clone(fallback),
                req.fallback_model.clone().unwrap_or_else(|| req.model.clone()),
            ));
        }

        let mut attempt_idx = 0;
        let mut deltas_emitted = false;
        let mut registered: Vec<Approval> = Vec::new();
        let mut final_text = String::new();

        let mut round = 0;
        while round < MAX_TOOL_ROUNDS {
            let (provider, model) = &attempts[attempt_idx];
            let provider_req = ProviderRequest {
                model: model.clone(),
                system: system.clone(),
                messages: convo.clone(),
                tools: tool_defs.clone(),
                max_tokens: MAX_OUTPUT_TOKENS,
            };

            let streamed = stream_once(provider.as_ref(), &provider_req, draft, &mut deltas_emitted)
                .await;

            let (text, tool_calls) = match streamed {
                Ok(out) => out,
                Err(e) => {
                    // Pre-stream failures may fall back; anything after the
                    // first delta must not switch providers.
                    if !deltas_emitted && attempt_idx + 1 < attempts.len() {
                        let (fallback, _) = &attempts[attempt_idx + 1];
                        // Fallback usage is security-relevant; an audit
                        // failure here fails the turn.
                        self.deps.audit.append(
                            &AuditActor::system("agent-executor"),
                            "agent.turn.provider.fallback",
                            serde_json::json!({
                                "primaryProvider": provider.name(),
                                "fallbackProvider": fallback.name(),
                                "error": e.to_string(),
                            }),
                            Some(&req.correlation_id),
                        )?;
                        warn!(
                            primary = provider.name(),
                            fallback = fallback.name(),
                            error = %e,
                            "provider failed pre-stream, trying fallback"
                        );
                        attempt_idx += 1;
                        continue;
                    }
                    return Err(e.into());
                }
            };

            if tool_calls.is_empty() {
                if !text.is_empty() {
                    self.deps.sessions.append_message(
                        &req.session_id,
                        Role::Assistant,
                        &[MessagePart::text(text.clone())],
                        &req.correlation_id,
                    )?;
                }
                final_text = text;
                break;
            }

            // Split the round's calls into gated and executable.
            let mut assistant_parts: Vec<MessagePart> = Vec::new();
            if !text.is_empty() {
                assistant_parts.push(MessagePart::text(text.clone()));
            }
            let mut gated: Vec<ToolCall> = Vec::new();
            let mut executable: Vec<ToolCall> = Vec::new();
            for call in tool_calls {
                let needs_approval = tools
                    .iter()
                    .find(|t| t.name() == call.name)
                    .map(|t| t.needs_approval(&call.input))
                    .unwrap_or(false);
                if needs_approval {
                    assistant_parts.push(MessagePart::ToolApprovalRequest {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    });
                    gated.push(call);
                } else {
                    assistant_parts.push(MessagePart::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    });
                    executable.push(call);
                }
            }

            self.deps.sessions.append_message(
                &req.session_id,
                Role::Assistant,
                &assistant_parts,
                &req.correlation_id,
            )?;
            convo.push(ProviderMessage {
                role: Role::Assistant,
                parts: assistant_parts,
            });

            for call in &gated {
                let approval = self.deps.approvals.register(ApprovalRequest {
                    session_id: req.session_id.clone(),
                    chat_id: req.scope.chat_id,
                    user_id: req.scope.user_id,
                    correlation_id: req.correlation_id.clone(),
                    tool_name: call.name.clone(),
                    tool_call_id: call.id.clone(),
                    tool_input: call.input.clone(),
                    risk_profile: req.risk_profile,
                })?;
                registered.push(approval);
            }

            if !executable.is_empty() {
                let mut result_parts: Vec<MessagePart> = Vec::new();
                for call in &executable {
                    let outcome = execute_tool(&tools, call).await;
                    tool_summaries.push(summarize_tool(&call.name, &outcome));
                    result_parts.push(MessagePart::ToolResult {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        output: outcome.output,
                        is_error: outcome.is_error,
                    });
                }
                self.deps.sessions.append_message(
                    &req.session_id,
                    Role::Tool,
                    &result_parts,
                    &req.correlation_id,
                )?;
                convo.push(ProviderMessage {
                    role: Role::Tool,
                    parts: result_parts,
                });
            }

            if !gated.is_empty() {
                // The turn pauses here; the approval decision re-enters as
                // a fresh turn with a tool-approval-response part.
                final_text = text;
                break;
            }

            round += 1;
        }

        draft.finish(Some(&final_text)).await;

        let pending = self
            .deps
            .approvals
            .pending_for_session(&req.session_id)?
            .len();
        let ctx = ResponseContext {
            approved_callback: matches!(
                req.input,
                TurnInput::ApprovalResponse { approved: true, .. }
            ),
            user_request: match &req.input {
                TurnInput::Text { text } => Some(text.clone()),
                TurnInput::ApprovalResponse { .. } => None,
            },
            pending_approvals: pending,
            tool_summaries,
        };
        let PolicyOutcome {
            text,
            forced_approved_status,
            reask_blocked,
        } = apply_response_policy(&final_text, &ctx);

        if reask_blocked {
            if let Err(e) = self.deps.audit.append(
                &AuditActor::system("agent-executor"),
                "agent.turn.reask_blocked",
                serde_json::json!({ "session_id": req.session_id }),
                Some(&req.correlation_id),
            ) {
                warn!(error = %e, "audit append failed for reask_blocked");
            }
        }

        info!(
            session_id = %req.session_id,
            approvals = registered.len(),
            forced = forced_approved_status,
            "turn complete"
        );
        Ok(TurnOutcome {
            text,
            forced_approved_status,
            registered_approvals: registered,
        })
    }
}

/// Walk the conversation backwards for the approval-request part the
/// decision refers to, returning its original tool input.
fn find_gated_input(convo: &[ProviderMessage], tool_call_id: &str) -> Option<serde_json::Value> {
    convo.iter().rev().find_map(|message| {
        message.parts.iter().find_map(|part| match part {
            MessagePart::ToolApprovalRequest { id, input, .. } if id == tool_call_id => {
                Some(input.clone())
            }
            _ => None,
        })
    })
}

fn incoming_message(input: &TurnInput) -> (Role, Vec<MessagePart>) {
    match input {
        TurnInput::Text { text } => (Role::User, vec![MessagePart::text(text.clone())]),
        TurnInput::ApprovalResponse {
            tool_call_id,
            approved,
            ..
        } => (
            Role::Tool,
            vec![MessagePart::ToolApprovalResponse {
                id: tool_call_id.clone(),
                approved: *approved,
            }],
        ),
    }
}

/// Drive one provider stream, forwarding deltas to the draft sink.
async fn stream_once(
    provider: &dyn LlmProvider,
    req: &ProviderRequest,
    draft: &dyn DraftSink,
    deltas_emitted: &mut bool,
) -> std::result::Result<(String, Vec<ToolCall>), ProviderError> {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    // Drain events while the provider runs; draft sends must observe
    // delta order, so this loop is the only consumer.
    let stream_fut = provider.stream(req, tx);
    tokio::pin!(stream_fut);
    let mut stream_result: Option<std::result::Result<(), ProviderError>> = None;

    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                match event {
                    Some(StreamEvent::TextDelta { text: delta }) => {
                        *deltas_emitted = true;
                        draft.push_delta(&delta).await;
                        text.push_str(&delta);
                    }
                    Some(StreamEvent::ToolUse { id, name, input }) => {
                        tool_calls.push(ToolCall { id, name, input });
                    }
                    Some(StreamEvent::Done { .. }) => {}
                    None => break,
                }
            }
            result = &mut stream_fut, if stream_result.is_none() => {
                stream_result = Some(result);
            }
        }
    }

    match stream_result {
        Some(Err(e)) => Err(e),
        Some(Ok(())) => Ok((text, tool_calls)),
        // Channel closed without the future resolving first: poll it out.
        None => match stream_fut.await {
            Ok(()) => Ok((text, tool_calls)),
            Err(e) => Err(e),
        },
    }
}

async fn execute_tool(tools: &[Arc<dyn Tool>], call: &ToolCall) -> ToolOutcome {
    match tools.iter().find(|t| t.name() == call.name) {
        Some(tool) => tool.execute(call.input.clone()).await,
        None => ToolOutcome::error(format!("unknown tool: {}", call.name)),
    }
}

/// Pull destination/hash hints out of a tool result for the response policy.
fn summarize_tool(name: &str, outcome: &ToolOutcome) -> ToolSummary {
    let get_str = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| outcome.output.get(k).and_then(|v| v.as_str()))
            .map(String::from)
    };
    ToolSummary {
        tool_name: name.to_string(),
        destination: get_str(&["destination", "to", "address"]),
        tx_hash: get_str(&["hash", "tx_hash", "txHash"]),
    }
}
