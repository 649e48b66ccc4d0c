//! End-to-end turn execution against scripted providers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::mpsc;

use courier_agent::executor::{TurnDeps, TurnExecutor};
use courier_agent::provider::{
    LlmProvider, ProviderError, ProviderRequest, StopReason, StreamEvent,
};
use courier_agent::tools::{Tool, ToolKind, ToolOutcome};
use courier_agent::{DraftSink, NoopDraftSink};
use courier_approvals::engine::ApprovalEngine;
use courier_approvals::ApprovalStatus;
use courier_audit::AuditChain;
use courier_core::types::{
    ChatKind, ChatScope, MessagePart, ResponseStyle, RiskProfile, Role, TurnExecutionRequest,
    TurnInput,
};
use courier_kv::{KvStore, MemoryKv};
use courier_queue::QueueStore;
use courier_store::ConversationStore;

/// One scripted model round: events to emit, then the return value.
struct ScriptedRound {
    events: Vec<StreamEvent>,
    result: Result<(), ProviderError>,
}

struct ScriptedProvider {
    name: &'static str,
    rounds: Mutex<VecDeque<ScriptedRound>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(name: &'static str, rounds: Vec<ScriptedRound>) -> Arc<Self> {
        Arc::new(Self {
            name,
            rounds: Mutex::new(rounds.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn text_round(text: &str) -> ScriptedRound {
        ScriptedRound {
            events: vec![
                StreamEvent::TextDelta {
                    text: text.to_string(),
                },
                StreamEvent::Done {
                    stop_reason: StopReason::EndTurn,
                },
            ],
            result: Ok(()),
        }
    }

    fn failure(message: &str) -> ScriptedRound {
        ScriptedRound {
            events: vec![],
            result: Err(ProviderError::Unavailable(message.to_string())),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn stream(
        &self,
        _req: &ProviderRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedProvider::text_round("exhausted"));
        for event in round.events {
            let _ = tx.send(event).await;
        }
        round.result
    }
}

struct FakeTool {
    name: &'static str,
    kind: ToolKind,
    output: serde_json::Value,
    calls: AtomicUsize,
}

impl FakeTool {
    fn new(name: &'static str, kind: ToolKind, output: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            output,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Tool for FakeTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    fn kind(&self) -> ToolKind {
        self.kind
    }
    async fn execute(&self, _input: serde_json::Value) -> ToolOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ToolOutcome::success(self.output.clone())
    }
}

/// Draft sink that records every delta it sees.
#[derive(Default)]
struct CaptureSink {
    deltas: Mutex<Vec<String>>,
    finished: AtomicUsize,
}

#[async_trait]
impl DraftSink for CaptureSink {
    async fn push_delta(&self, text: &str) {
        self.deltas.lock().unwrap().push(text.to_string());
    }
    async fn finish(&self, _final_text: Option<&str>) -> bool {
        self.finished.fetch_add(1, Ordering::SeqCst);
        true
    }
}

struct Harness {
    executor: TurnExecutor,
    sessions: Arc<ConversationStore>,
    approvals: Arc<ApprovalEngine>,
    audit: Arc<AuditChain>,
    session_id: String,
}

fn harness(
    primary: Arc<ScriptedProvider>,
    fallback: Option<Arc<ScriptedProvider>>,
    tools: Vec<Arc<dyn Tool>>,
) -> Harness {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let sessions =
        Arc::new(ConversationStore::new(Connection::open_in_memory().unwrap()).unwrap());
    let audit = Arc::new(AuditChain::new(Connection::open_in_memory().unwrap()).unwrap());
    let queue = Arc::new(QueueStore::new(Connection::open_in_memory().unwrap()).unwrap());
    let approvals = Arc::new(
        ApprovalEngine::new(
            Connection::open_in_memory().unwrap(),
            Arc::clone(&kv),
            Arc::clone(&audit),
            queue,
        )
        .unwrap(),
    );

    let scope = ChatScope::new(-100, 2001, None);
    let session = sessions.get_or_create(&scope).unwrap();

    let executor = TurnExecutor::new(TurnDeps {
        kv,
        sessions: Arc::clone(&sessions),
        approvals: Arc::clone(&approvals),
        audit: Arc::clone(&audit),
        primary: primary as Arc<dyn LlmProvider>,
        fallback: fallback.map(|f| f as Arc<dyn LlmProvider>),
        tools,
    });

    Harness {
        executor,
        sessions,
        approvals,
        audit,
        session_id: session.id,
    }
}

fn text_request(session_id: &str, text: &str) -> TurnExecutionRequest {
    TurnExecutionRequest {
        correlation_id: "corr-test".into(),
        session_id: session_id.to_string(),
        scope: ChatScope::new(-100, 2001, None),
        chat_kind: ChatKind::Private,
        input: TurnInput::Text { text: text.into() },
        network: "mainnet".into(),
        model: "primary-model".into(),
        fallback_model: Some("fallback-model".into()),
        response_style: ResponseStyle::Concise,
        risk_profile: RiskProfile::Balanced,
        wallet_address: None,
    }
}

#[tokio::test]
async fn plain_text_turn_streams_and_persists() {
    let primary = ScriptedProvider::new(
        "primary",
        vec![ScriptedRound {
            events: vec![
                StreamEvent::TextDelta { text: "Hel".into() },
                StreamEvent::TextDelta { text: "lo".into() },
                StreamEvent::Done {
                    stop_reason: StopReason::EndTurn,
                },
            ],
            result: Ok(()),
        }],
    );
    let h = harness(primary, None, vec![]);
    let sink = CaptureSink::default();

    let outcome = h
        .executor
        .execute(&text_request(&h.session_id, "say hello"), &sink)
        .await
        .unwrap();

    assert_eq!(outcome.text, "Hello");
    assert!(!outcome.forced_approved_status);
    assert_eq!(
        *sink.deltas.lock().unwrap(),
        vec!["Hel".to_string(), "lo".to_string()]
    );
    assert_eq!(sink.finished.load(Ordering::SeqCst), 1);

    let messages = h.sessions.load_recent(&h.session_id, 80).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].parts, vec![MessagePart::text("Hello")]);
}

#[tokio::test]
async fn pre_stream_failure_falls_back_with_audit() {
    let primary = ScriptedProvider::new("primary", vec![ScriptedProvider::failure("boom")]);
    let fallback = ScriptedProvider::new(
        "fallback",
        vec![ScriptedProvider::text_round("Complete answer from fallback")],
    );
    let h = harness(Arc::clone(&primary), Some(Arc::clone(&fallback)), vec![]);

    let outcome = h
        .executor
        .execute(&text_request(&h.session_id, "hi"), &NoopDraftSink)
        .await
        .unwrap();

    assert_eq!(outcome.text, "Complete answer from fallback");
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);

    let events = h.audit.by_correlation("corr-test").unwrap();
    let fallback_event = events
        .iter()
        .find(|e| e.event_type == "agent.turn.provider.fallback")
        .expect("fallback audit event missing");
    assert_eq!(fallback_event.metadata["primaryProvider"], "primary");
    assert_eq!(fallback_event.metadata["fallbackProvider"], "fallback");
}

#[tokio::test]
async fn mid_stream_failure_never_switches_providers() {
    let primary = ScriptedProvider::new(
        "primary",
        vec![ScriptedRound {
            events: vec![
                StreamEvent::TextDelta { text: "one ".into() },
                StreamEvent::TextDelta { text: "two ".into() },
                StreamEvent::TextDelta { text: "three".into() },
            ],
            result: Err(ProviderError::Unavailable("mid-stream".into())),
        }],
    );
    let fallback = ScriptedProvider::new("fallback", vec![]);
    let h = harness(Arc::clone(&primary), Some(Arc::clone(&fallback)), vec![]);

    let err = h
        .executor
        .execute(&text_request(&h.session_id, "hi"), &NoopDraftSink)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("mid-stream"));
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    assert!(h
        .audit
        .by_correlation("corr-test")
        .unwrap()
        .iter()
        .all(|e| e.event_type != "agent.turn.provider.fallback"));
}

#[tokio::test]
async fn tool_round_executes_and_continues() {
    let primary = ScriptedProvider::new(
        "primary",
        vec![
            ScriptedRound {
                events: vec![
                    StreamEvent::ToolUse {
                        id: "call_1".into(),
                        name: "getBalance".into(),
                        input: serde_json::json!({"address": "EQabc"}),
                    },
                    StreamEvent::Done {
                        stop_reason: StopReason::ToolUse,
                    },
                ],
                result: Ok(()),
            },
            ScriptedProvider::text_round("Your balance is 10."),
        ],
    );
    let tool = FakeTool::new(
        "getBalance",
        ToolKind::ReadOnly,
        serde_json::json!({"balance": 10}),
    );
    let h = harness(primary, None, vec![tool.clone() as Arc<dyn Tool>]);

    let outcome = h
        .executor
        .execute(&text_request(&h.session_id, "balance?"), &NoopDraftSink)
        .await
        .unwrap();

    assert_eq!(outcome.text, "Your balance is 10.");
    assert_eq!(tool.calls.load(Ordering::SeqCst), 1);

    let messages = h.sessions.load_recent(&h.session_id, 80).unwrap();
    // user, assistant(tool call), tool(result), assistant(text)
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].role, Role::Assistant);
    assert!(matches!(
        messages[1].parts[0],
        MessagePart::ToolCall { .. }
    ));
    assert_eq!(messages[2].role, Role::Tool);
    assert!(matches!(
        messages[2].parts[0],
        MessagePart::ToolResult { .. }
    ));
}

#[tokio::test]
async fn critical_write_is_gated_behind_approval() {
    let primary = ScriptedProvider::new(
        "primary",
        vec![ScriptedRound {
            events: vec![
                StreamEvent::TextDelta {
                    text: "I prepared the transfer.".into(),
                },
                StreamEvent::ToolUse {
                    id: "call_9".into(),
                    name: "sendMessage".into(),
                    input: serde_json::json!({"amount": 2.5, "to": "EQdest"}),
                },
                StreamEvent::Done {
                    stop_reason: StopReason::ToolUse,
                },
            ],
            result: Ok(()),
        }],
    );
    let tool = FakeTool::new(
        "sendMessage",
        ToolKind::CriticalWrite,
        serde_json::json!({"sent": true}),
    );
    let h = harness(Arc::clone(&primary), None, vec![tool.clone() as Arc<dyn Tool>]);

    let outcome = h
        .executor
        .execute(&text_request(&h.session_id, "send 2.5"), &NoopDraftSink)
        .await
        .unwrap();

    // One approval registered, the tool did NOT run, one provider round.
    assert_eq!(outcome.registered_approvals.len(), 1);
    assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    let approval = &outcome.registered_approvals[0];
    assert_eq!(approval.status, ApprovalStatus::Requested);
    assert_eq!(approval.tool_name, "sendMessage");

    assert!(outcome.text.contains("Approval pending"));

    let messages = h.sessions.load_recent(&h.session_id, 80).unwrap();
    let assistant = &messages[1];
    assert!(assistant
        .parts
        .iter()
        .any(|p| matches!(p, MessagePart::ToolApprovalRequest { .. })));
}

#[tokio::test]
async fn approved_callback_with_trivial_reply_is_rewritten() {
    let primary = ScriptedProvider::new(
        "primary",
        vec![
            // Round 1: execute the (now approved) protected tool.
            ScriptedRound {
                events: vec![
                    StreamEvent::ToolUse {
                        id: "call_2".into(),
                        name: "transferNote".into(),
                        input: serde_json::json!({"note": "x"}),
                    },
                    StreamEvent::Done {
                        stop_reason: StopReason::ToolUse,
                    },
                ],
                result: Ok(()),
            },
            // Round 2: a lazy "done".
            ScriptedProvider::text_round("done"),
        ],
    );
    let tool = FakeTool::new(
        "transferNote",
        ToolKind::Write,
        serde_json::json!({"destination": "EQdest", "hash": "deadbeef"}),
    );
    let h = harness(primary, None, vec![tool as Arc<dyn Tool>]);

    let mut req = text_request(&h.session_id, "");
    req.input = TurnInput::ApprovalResponse {
        approval_id: "apr_x".into(),
        tool_call_id: "call_9".into(),
        tool_name: "sendMessage".into(),
        approved: true,
    };

    let outcome = h.executor.execute(&req, &NoopDraftSink).await.unwrap();

    assert!(outcome.text.starts_with("Approval received."));
    assert!(outcome.text.contains("EQdest"));
    assert!(outcome.text.contains("deadbeef"));
    assert!(outcome.forced_approved_status);

    // The suppressed re-ask is audited.
    assert!(h
        .audit
        .by_correlation("corr-test")
        .unwrap()
        .iter()
        .any(|e| e.event_type == "agent.turn.reask_blocked"));
}

#[tokio::test]
async fn approved_decision_executes_the_gated_call() {
    let primary = ScriptedProvider::new(
        "primary",
        vec![ScriptedProvider::text_round(
            "Sent 2.5 to EQdest. Hash: feedc0de.",
        )],
    );
    let tool = FakeTool::new(
        "sendMessage",
        ToolKind::CriticalWrite,
        serde_json::json!({"destination": "EQdest", "hash": "feedc0de"}),
    );
    let h = harness(primary, None, vec![tool.clone() as Arc<dyn Tool>]);

    // Seed the history with the gated call from the previous turn.
    h.sessions
        .append_message(
            &h.session_id,
            Role::Assistant,
            &[MessagePart::ToolApprovalRequest {
                id: "call_9".into(),
                name: "sendMessage".into(),
                input: serde_json::json!({"amount": 2.5, "to": "EQdest"}),
            }],
            "corr-prev",
        )
        .unwrap();

    let mut req = text_request(&h.session_id, "");
    req.input = TurnInput::ApprovalResponse {
        approval_id: "apr_1".into(),
        tool_call_id: "call_9".into(),
        tool_name: "sendMessage".into(),
        approved: true,
    };

    let outcome = h.executor.execute(&req, &NoopDraftSink).await.unwrap();

    // The protected tool ran exactly once, before the model resumed.
    assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    assert!(outcome.text.contains("EQdest"));

    // The resumption turn persisted the approval response plus the result.
    let messages = h.sessions.load_recent(&h.session_id, 80).unwrap();
    let resumption = messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("resumption message missing");
    assert!(resumption
        .parts
        .iter()
        .any(|p| matches!(p, MessagePart::ToolApprovalResponse { approved: true, .. })));
    assert!(resumption
        .parts
        .iter()
        .any(|p| matches!(p, MessagePart::ToolResult { .. })));
}

#[tokio::test]
async fn group_chat_drops_write_tools() {
    let primary = ScriptedProvider::new(
        "primary",
        vec![ScriptedRound {
            events: vec![
                StreamEvent::ToolUse {
                    id: "call_3".into(),
                    name: "sendMessage".into(),
                    input: serde_json::json!({"amount": 1}),
                },
                StreamEvent::Done {
                    stop_reason: StopReason::ToolUse,
                },
            ],
            result: Ok(()),
        }],
    );
    let tool = FakeTool::new(
        "sendMessage",
        ToolKind::CriticalWrite,
        serde_json::json!({}),
    );
    let h = harness(primary, None, vec![tool.clone() as Arc<dyn Tool>]);

    let mut req = text_request(&h.session_id, "send");
    req.chat_kind = ChatKind::Group;
    let outcome = h.executor.execute(&req, &NoopDraftSink).await.unwrap();

    // The tool was filtered out, so the call resolves to "unknown tool"
    // and nothing is gated or executed.
    assert_eq!(outcome.registered_approvals.len(), 0);
    assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
}
