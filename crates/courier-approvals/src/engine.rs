//! Approval lifecycle: registration, TTL scheduling, decision, expiry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use courier_audit::{AuditActor, AuditChain};
use courier_core::config::{APPROVAL_COUNTDOWN_SECS, APPROVAL_TTL_SECS};
use courier_core::types::RiskProfile;
use courier_kv::{token::url_safe_token, KvStore};
use courier_queue::types::{QUEUE_APPROVAL_COUNTDOWNS, QUEUE_APPROVAL_TIMEOUTS};
use courier_queue::QueueStore;

use crate::db::init_db;
use crate::error::{ApprovalError, Result};
use crate::risk::assess_risk;
use crate::types::{Approval, ApprovalStatus, DecisionKind, RiskConfidence, RiskLevel};

/// TTL of the cautious-mode confirmation marker.
const CONFIRM_MARKER_TTL: Duration = Duration::from_secs(30);

/// Outcome of a decision attempt.
#[derive(Debug, Clone)]
pub enum DecideOutcome {
    /// Transitioned to a terminal state.
    Decided(Approval),
    /// Cautious-mode double-tap: the first tap armed a marker; the same
    /// tap within the window completes the decision.
    ConfirmationRequired { window_secs: u64 },
}

/// What gets registered for one `tool-approval-request` part.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub chat_id: i64,
    pub user_id: i64,
    pub correlation_id: String,
    pub tool_name: String,
    pub tool_call_id: String,
    pub tool_input: serde_json::Value,
    pub risk_profile: RiskProfile,
}

pub struct ApprovalEngine {
    conn: Mutex<Connection>,
    kv: Arc<dyn KvStore>,
    audit: Arc<AuditChain>,
    queue: Arc<QueueStore>,
}

impl ApprovalEngine {
    pub fn new(
        conn: Connection,
        kv: Arc<dyn KvStore>,
        audit: Arc<AuditChain>,
        queue: Arc<QueueStore>,
    ) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            kv,
            audit,
            queue,
        })
    }

    /// Persist a new approval and schedule its expiry and countdown jobs.
    #[instrument(skip(self, request), fields(tool = %request.tool_name))]
    pub fn register(&self, request: ApprovalRequest) -> Result<Approval> {
        let assessment = assess_risk(
            &request.tool_name,
            &request.tool_input,
            request.risk_profile,
        );
        let approval_id = format!("apr_{}", Uuid::new_v4().simple());
        let callback_token = url_safe_token()?;
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(APPROVAL_TTL_SECS);

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO approvals
                 (approval_id, callback_token, session_id, chat_id, user_id, correlation_id,
                  tool_name, tool_call_id, tool_input, risk_level, risk_confidence,
                  status, expires_at, decided_by, decided_at, prompt_message_id, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,'requested',?12,NULL,NULL,NULL,?13)",
                rusqlite::params![
                    approval_id,
                    callback_token,
                    request.session_id,
                    request.chat_id,
                    request.user_id,
                    request.correlation_id,
                    request.tool_name,
                    request.tool_call_id,
                    serde_json::to_string(&request.tool_input)?,
                    assessment.level.to_string(),
                    assessment.confidence.to_string(),
                    expires_at.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )?;
        }

        // Expiry fires once at TTL; the countdown refresh reschedules
        // itself with a per-tick id suffix until the approval settles.
        self.queue.enqueue_delayed(
            QUEUE_APPROVAL_TIMEOUTS,
            Some(&format!("approval-timeout-{approval_id}")),
            &serde_json::json!({ "approval_id": approval_id }),
            Duration::from_secs(APPROVAL_TTL_SECS as u64),
            Some(&request.correlation_id),
        )?;
        self.queue.enqueue_delayed(
            QUEUE_APPROVAL_COUNTDOWNS,
            Some(&format!("approval-countdown-{approval_id}-1")),
            &serde_json::json!({ "approval_id": approval_id, "tick": 1 }),
            Duration::from_secs(APPROVAL_COUNTDOWN_SECS as u64),
            Some(&request.correlation_id),
        )?;

        // approval.requested is informational; a failed append must not
        // block the turn that produced the request.
        if let Err(e) = self.audit.append(
            &AuditActor::user(request.user_id),
            "approval.requested",
            serde_json::json!({
                "approval_id": approval_id,
                "tool_name": request.tool_name,
                "risk_level": assessment.level.to_string(),
                "risk_confidence": assessment.confidence.to_string(),
            }),
            Some(&request.correlation_id),
        ) {
            warn!(approval_id, error = %e, "audit append failed for approval.requested");
        }

        info!(approval_id, tool = %request.tool_name, risk = %assessment.level, "approval registered");
        self.get(&approval_id)?.ok_or(ApprovalError::UnknownToken)
    }

    pub fn get(&self, approval_id: &str) -> Result<Option<Approval>> {
        let conn = self.conn.lock().unwrap();
        query_one(
            &conn,
            "SELECT * FROM approvals WHERE approval_id = ?1",
            approval_id,
        )
    }

    pub fn get_by_token(&self, callback_token: &str) -> Result<Option<Approval>> {
        let conn = self.conn.lock().unwrap();
        query_one(
            &conn,
            "SELECT * FROM approvals WHERE callback_token = ?1",
            callback_token,
        )
    }

    /// Approvals still pending for a session (used for the response-policy
    /// suffix).
    pub fn pending_for_session(&self, session_id: &str) -> Result<Vec<Approval>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM approvals
             WHERE session_id = ?1 AND status = 'requested'
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map([session_id], row_to_approval)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Remember the transport message id of the pending card, so expiry and
    /// countdown workers can edit it.
    pub fn set_prompt_message(&self, approval_id: &str, message_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE approvals SET prompt_message_id = ?2 WHERE approval_id = ?1",
            rusqlite::params![approval_id, message_id],
        )?;
        Ok(())
    }

    /// Decide a pending approval by callback token.
    ///
    /// High/critical approvals under a cautious profile require the same
    /// tap twice within 30 s; the first tap arms a KV marker and returns
    /// `ConfirmationRequired`.
    #[instrument(skip(self), fields(kind = kind.as_str()))]
    pub async fn decide(
        &self,
        callback_token: &str,
        kind: DecisionKind,
        decider_user_id: i64,
        profile: RiskProfile,
    ) -> Result<DecideOutcome> {
        let approval = self
            .get_by_token(callback_token)?
            .ok_or(ApprovalError::UnknownToken)?;

        if approval.status != ApprovalStatus::Requested {
            return Err(ApprovalError::AlreadyDecided {
                status: approval.status,
            });
        }

        let now = Utc::now();
        if approval.expires_at < now {
            self.transition_expired(&approval.approval_id, now)?;
            return Err(ApprovalError::Expired);
        }

        let needs_double_tap = matches!(approval.risk_level, RiskLevel::High | RiskLevel::Critical)
            && profile == RiskProfile::Cautious;
        if needs_double_tap {
            let marker = format!(
                "approval:confirm:{}:{}",
                approval.approval_id,
                kind.as_str()
            );
            if self.kv.set_nx_px(&marker, "1", CONFIRM_MARKER_TTL).await? {
                // First tap: armed. The marker expires on its own if the
                // user never taps again, restarting the flow.
                return Ok(DecideOutcome::ConfirmationRequired {
                    window_secs: CONFIRM_MARKER_TTL.as_secs(),
                });
            }
            if let Err(e) = self.kv.delete(&marker).await {
                warn!(error = %e, "failed to clear confirmation marker");
            }
        }

        let terminal = kind.terminal_status();
        {
            let conn = self.conn.lock().unwrap();
            let changed = conn.execute(
                "UPDATE approvals
                 SET status = ?2, decided_by = ?3, decided_at = ?4
                 WHERE approval_id = ?1 AND status = 'requested'",
                rusqlite::params![
                    approval.approval_id,
                    terminal.to_string(),
                    decider_user_id,
                    now.to_rfc3339()
                ],
            )?;
            if changed == 0 {
                // Lost the race against a concurrent decision or expiry.
                let current = query_one(
                    &conn,
                    "SELECT * FROM approvals WHERE approval_id = ?1",
                    &approval.approval_id,
                )?
                .ok_or(ApprovalError::UnknownToken)?;
                return Err(ApprovalError::AlreadyDecided {
                    status: current.status,
                });
            }
        }

        // The decision event is security-critical: an append failure here
        // is the caller's failure.
        self.audit.append(
            &AuditActor::user(decider_user_id),
            "approval.decided",
            serde_json::json!({
                "approval_id": approval.approval_id,
                "tool_name": approval.tool_name,
                "decision": kind.as_str(),
                "risk_level": approval.risk_level.to_string(),
            }),
            Some(&approval.correlation_id),
        )?;

        info!(approval_id = %approval.approval_id, status = %terminal, "approval decided");
        let updated = self
            .get(&approval.approval_id)?
            .ok_or(ApprovalError::UnknownToken)?;
        Ok(DecideOutcome::Decided(updated))
    }

    /// Expiry worker entry point. Transitions to `expired` iff the approval
    /// is still `requested` and its TTL has elapsed; returns the updated
    /// approval for user notification, or `None` when there is nothing to do.
    pub fn expire_if_due(&self, approval_id: &str) -> Result<Option<Approval>> {
        let approval = self.get(approval_id)?.ok_or(ApprovalError::UnknownToken)?;
        let now = Utc::now();
        if approval.status != ApprovalStatus::Requested || approval.expires_at > now {
            return Ok(None);
        }
        self.transition_expired(approval_id, now)?;
        self.get(approval_id)
    }

    /// Countdown worker support: the approval plus remaining seconds, or
    /// `None` when the countdown should stop (settled or expired).
    pub fn countdown_state(&self, approval_id: &str) -> Result<Option<(Approval, i64)>> {
        let Some(approval) = self.get(approval_id)? else {
            return Ok(None);
        };
        let now = Utc::now();
        if approval.status != ApprovalStatus::Requested || approval.expires_at <= now {
            return Ok(None);
        }
        let remaining = approval.remaining_secs(now);
        Ok(Some((approval, remaining)))
    }

    /// Schedule the next countdown refresh at `min(30 s, time-to-expiry)`.
    pub fn reschedule_countdown(
        &self,
        approval: &Approval,
        tick: u64,
        remaining_secs: i64,
    ) -> Result<()> {
        let delay = remaining_secs.clamp(1, APPROVAL_COUNTDOWN_SECS) as u64;
        self.queue.enqueue_delayed(
            QUEUE_APPROVAL_COUNTDOWNS,
            Some(&format!(
                "approval-countdown-{}-{}",
                approval.approval_id,
                tick + 1
            )),
            &serde_json::json!({ "approval_id": approval.approval_id, "tick": tick + 1 }),
            Duration::from_secs(delay),
            Some(&approval.correlation_id),
        )?;
        Ok(())
    }

    /// Mark an approval failed (e.g. the follow-up turn could not run).
    pub fn mark_failed(&self, approval_id: &str, reason: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE approvals SET status = 'failed', decided_at = ?2
             WHERE approval_id = ?1 AND status = 'requested'",
            rusqlite::params![approval_id, now],
        )?;
        warn!(approval_id, reason, "approval marked failed");
        Ok(())
    }

    fn transition_expired(&self, approval_id: &str, now: DateTime<Utc>) -> Result<()> {
        let changed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE approvals SET status = 'expired', decided_at = ?2
                 WHERE approval_id = ?1 AND status = 'requested'",
                rusqlite::params![approval_id, now.to_rfc3339()],
            )?
        };
        if changed > 0 {
            if let Err(e) = self.audit.append(
                &AuditActor::system("approval-engine"),
                "approval.expired",
                serde_json::json!({ "approval_id": approval_id }),
                None,
            ) {
                warn!(approval_id, error = %e, "audit append failed for approval.expired");
            }
        }
        Ok(())
    }
}

fn query_one(conn: &Connection, sql: &str, key: &str) -> Result<Option<Approval>> {
    let mut stmt = conn.prepare_cached(sql)?;
    match stmt.query_row([key], row_to_approval) {
        Ok(a) => Ok(Some(a)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<Approval> {
    let tool_input: String = row.get("tool_input")?;
    let risk_level: String = row.get("risk_level")?;
    let risk_confidence: String = row.get("risk_confidence")?;
    let status: String = row.get("status")?;
    let expires_at: String = row.get("expires_at")?;
    let decided_at: Option<String> = row.get("decided_at")?;
    let created_at: String = row.get("created_at")?;

    Ok(Approval {
        approval_id: row.get("approval_id")?,
        callback_token: row.get("callback_token")?,
        session_id: row.get("session_id")?,
        chat_id: row.get("chat_id")?,
        user_id: row.get("user_id")?,
        correlation_id: row.get("correlation_id")?,
        tool_name: row.get("tool_name")?,
        tool_call_id: row.get("tool_call_id")?,
        tool_input: serde_json::from_str(&tool_input).unwrap_or(serde_json::Value::Null),
        risk_level: risk_level.parse().unwrap_or(RiskLevel::Critical),
        risk_confidence: risk_confidence.parse().unwrap_or(RiskConfidence::Low),
        status: status.parse().unwrap_or(ApprovalStatus::Failed),
        expires_at: parse_ts(&expires_at),
        decided_by: row.get("decided_by")?,
        decided_at: decided_at.as_deref().map(parse_ts),
        prompt_message_id: row.get("prompt_message_id")?,
        created_at: parse_ts(&created_at),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_kv::MemoryKv;
    use courier_queue::types::QUEUE_APPROVAL_TIMEOUTS;

    fn engine() -> ApprovalEngine {
        let kv = Arc::new(MemoryKv::new());
        let audit =
            Arc::new(AuditChain::new(Connection::open_in_memory().unwrap()).unwrap());
        let queue =
            Arc::new(QueueStore::new(Connection::open_in_memory().unwrap()).unwrap());
        ApprovalEngine::new(Connection::open_in_memory().unwrap(), kv, audit, queue).unwrap()
    }

    fn request(tool: &str, input: serde_json::Value, profile: RiskProfile) -> ApprovalRequest {
        ApprovalRequest {
            session_id: "sess-1".into(),
            chat_id: -100,
            user_id: 2001,
            correlation_id: "corr-1".into(),
            tool_name: tool.into(),
            tool_call_id: "call_1".into(),
            tool_input: input,
            risk_profile: profile,
        }
    }

    #[tokio::test]
    async fn happy_path_approve() {
        let e = engine();
        let approval = e
            .register(request(
                "sendMessage",
                serde_json::json!({"amount": 2.5}),
                RiskProfile::Balanced,
            ))
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Requested);
        assert_eq!(approval.callback_token.len(), 16);
        assert!(approval.approval_id.starts_with("apr_"));

        let outcome = e
            .decide(
                &approval.callback_token,
                DecisionKind::Approve,
                2001,
                RiskProfile::Balanced,
            )
            .await
            .unwrap();
        let decided = match outcome {
            DecideOutcome::Decided(a) => a,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.decided_by, Some(2001));

        // Audit trail: requested then decided.
        let events = e.audit.by_correlation("corr-1").unwrap();
        let types: Vec<&str> = events.iter().map(|ev| ev.event_type.as_str()).collect();
        assert_eq!(types, vec!["approval.requested", "approval.decided"]);
    }

    #[tokio::test]
    async fn second_decision_rejected_with_status() {
        let e = engine();
        let approval = e
            .register(request(
                "sendMessage",
                serde_json::json!({}),
                RiskProfile::Balanced,
            ))
            .unwrap();
        e.decide(
            &approval.callback_token,
            DecisionKind::Deny,
            2001,
            RiskProfile::Balanced,
        )
        .await
        .unwrap();

        let err = e
            .decide(
                &approval.callback_token,
                DecisionKind::Approve,
                2001,
                RiskProfile::Balanced,
            )
            .await
            .unwrap_err();
        match err {
            ApprovalError::AlreadyDecided { status } => {
                assert_eq!(status, ApprovalStatus::Denied)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_token_rejected() {
        let e = engine();
        let err = e
            .decide("nope", DecisionKind::Approve, 1, RiskProfile::Balanced)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::UnknownToken));
    }

    #[tokio::test]
    async fn cautious_critical_requires_double_tap() {
        let e = engine();
        let approval = e
            .register(request(
                "sendMessage",
                serde_json::json!({"amount": 150}),
                RiskProfile::Cautious,
            ))
            .unwrap();
        assert_eq!(approval.risk_level, RiskLevel::Critical);

        let first = e
            .decide(
                &approval.callback_token,
                DecisionKind::Approve,
                2001,
                RiskProfile::Cautious,
            )
            .await
            .unwrap();
        assert!(matches!(
            first,
            DecideOutcome::ConfirmationRequired { window_secs: 30 }
        ));
        // No decision recorded yet.
        assert_eq!(
            e.get(&approval.approval_id).unwrap().unwrap().status,
            ApprovalStatus::Requested
        );

        let second = e
            .decide(
                &approval.callback_token,
                DecisionKind::Approve,
                2001,
                RiskProfile::Cautious,
            )
            .await
            .unwrap();
        assert!(matches!(second, DecideOutcome::Decided(_)));
    }

    #[tokio::test]
    async fn low_risk_cautious_decides_in_one_tap() {
        let e = engine();
        let approval = e
            .register(request(
                "getBalance",
                serde_json::json!({}),
                RiskProfile::Advanced,
            ))
            .unwrap();
        assert_eq!(approval.risk_level, RiskLevel::Low);
        let outcome = e
            .decide(
                &approval.callback_token,
                DecisionKind::Approve,
                1,
                RiskProfile::Cautious,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DecideOutcome::Decided(_)));
    }

    #[tokio::test]
    async fn expiry_transitions_and_is_terminal() {
        let e = engine();
        let approval = e
            .register(request(
                "sendMessage",
                serde_json::json!({}),
                RiskProfile::Balanced,
            ))
            .unwrap();

        // Not yet due.
        assert!(e.expire_if_due(&approval.approval_id).unwrap().is_none());

        // Force the clock past the TTL.
        {
            let conn = e.conn.lock().unwrap();
            let past = (Utc::now() - chrono::Duration::seconds(10)).to_rfc3339();
            conn.execute(
                "UPDATE approvals SET expires_at = ?2 WHERE approval_id = ?1",
                rusqlite::params![approval.approval_id, past],
            )
            .unwrap();
        }

        let expired = e.expire_if_due(&approval.approval_id).unwrap().unwrap();
        assert_eq!(expired.status, ApprovalStatus::Expired);

        // A decision after expiry is rejected.
        let err = e
            .decide(
                &approval.callback_token,
                DecisionKind::Approve,
                1,
                RiskProfile::Balanced,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyDecided { .. }));
    }

    #[tokio::test]
    async fn decide_on_expired_pending_transitions_to_expired() {
        let e = engine();
        let approval = e
            .register(request(
                "sendMessage",
                serde_json::json!({}),
                RiskProfile::Balanced,
            ))
            .unwrap();
        {
            let conn = e.conn.lock().unwrap();
            let past = (Utc::now() - chrono::Duration::seconds(10)).to_rfc3339();
            conn.execute(
                "UPDATE approvals SET expires_at = ?2 WHERE approval_id = ?1",
                rusqlite::params![approval.approval_id, past],
            )
            .unwrap();
        }
        let err = e
            .decide(
                &approval.callback_token,
                DecisionKind::Approve,
                1,
                RiskProfile::Balanced,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Expired));
        assert_eq!(
            e.get(&approval.approval_id).unwrap().unwrap().status,
            ApprovalStatus::Expired
        );
    }

    #[tokio::test]
    async fn register_schedules_timeout_and_countdown() {
        let e = engine();
        e.register(request(
            "sendMessage",
            serde_json::json!({}),
            RiskProfile::Balanced,
        ))
        .unwrap();
        assert_eq!(e.queue.depth(QUEUE_APPROVAL_TIMEOUTS).unwrap(), 1);
        assert_eq!(e.queue.depth(QUEUE_APPROVAL_COUNTDOWNS).unwrap(), 1);
    }

    #[tokio::test]
    async fn countdown_state_stops_after_decision() {
        let e = engine();
        let approval = e
            .register(request(
                "sendMessage",
                serde_json::json!({}),
                RiskProfile::Balanced,
            ))
            .unwrap();
        assert!(e.countdown_state(&approval.approval_id).unwrap().is_some());
        e.decide(
            &approval.callback_token,
            DecisionKind::Approve,
            1,
            RiskProfile::Balanced,
        )
        .await
        .unwrap();
        assert!(e.countdown_state(&approval.approval_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_for_session_lists_only_requested() {
        let e = engine();
        let a = e
            .register(request(
                "sendMessage",
                serde_json::json!({}),
                RiskProfile::Balanced,
            ))
            .unwrap();
        let _b = e
            .register(request(
                "sendMessage",
                serde_json::json!({}),
                RiskProfile::Balanced,
            ))
            .unwrap();
        e.decide(
            &a.callback_token,
            DecisionKind::Deny,
            1,
            RiskProfile::Balanced,
        )
        .await
        .unwrap();
        let pending = e.pending_for_session("sess-1").unwrap();
        assert_eq!(pending.len(), 1);
    }
}
