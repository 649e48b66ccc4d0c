//! Queue handlers: updates, agent turns, approval timeouts and countdowns,
//! dead letters.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use courier_agent::{AgentError, NoopDraftSink};
use courier_core::error::USER_FACING_FAILURE;
use courier_core::types::TurnExecutionRequest;
use courier_queue::types::{
    QUEUE_AGENT_TURNS, QUEUE_APPROVAL_COUNTDOWNS, QUEUE_APPROVAL_TIMEOUTS, QUEUE_DEAD_LETTER,
    QUEUE_UPDATES,
};
use courier_queue::{Job, JobHandler, QueueEngine};
use courier_store::types::UpdateStatus;
use courier_transport::card::{
    approval_keyboard, render_approval_card, render_expired_card,
};
use courier_transport::{edit_text_quiet, send_text_chunked, DraftStreamer, SendOptions};

use crate::app::Services;
use crate::router::route_update;

/// Wire every queue to its handler.
pub fn build_engine(services: &Arc<Services>) -> QueueEngine {
    let mut engine = QueueEngine::new(Arc::clone(&services.queue));
    engine.register(
        QUEUE_UPDATES,
        Arc::new(UpdateWorker {
            services: Arc::clone(services),
        }),
    );
    engine.register(
        QUEUE_AGENT_TURNS,
        Arc::new(TurnWorker {
            services: Arc::clone(services),
        }),
    );
    engine.register(
        QUEUE_APPROVAL_TIMEOUTS,
        Arc::new(ApprovalTimeoutWorker {
            services: Arc::clone(services),
        }),
    );
    engine.register(
        QUEUE_APPROVAL_COUNTDOWNS,
        Arc::new(CountdownWorker {
            services: Arc::clone(services),
        }),
    );
    engine.register(QUEUE_DEAD_LETTER, Arc::new(DeadLetterWorker));
    engine
}

// ── Updates ───────────────────────────────────────────────────────────────────

struct UpdateWorker {
    services: Arc<Services>,
}

#[async_trait]
impl JobHandler for UpdateWorker {
    async fn handle(&self, job: &Job) -> Result<(), String> {
        let Some(update_id) = job.payload.get("update_id").and_then(|v| v.as_i64()) else {
            return Err("update job without update_id".into());
        };

        let update = self
            .services
            .updates
            .get(update_id)
            .map_err(|e| e.to_string())?;
        let Some(update) = update else {
            warn!(update_id, "stored update vanished before processing");
            return Ok(());
        };
        // At-least-once delivery: a redelivered, already-terminal update
        // is a no-op, unless this is an explicit operator replay.
        let replay = job
            .payload
            .get("replay")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if update.status.is_terminal() && !replay {
            return Ok(());
        }

        match route_update(&self.services, &update).await {
            Ok(()) => {
                self.services
                    .updates
                    .mark_status(update_id, UpdateStatus::Processed, None)
                    .map_err(|e| e.to_string())?;
                Ok(())
            }
            Err(e) => {
                if job.attempts >= job.max_attempts {
                    let _ = self.services.updates.mark_status(
                        update_id,
                        UpdateStatus::Failed,
                        Some(&e.to_string()),
                    );
                }
                Err(e.to_string())
            }
        }
    }
}

// ── Agent turns ───────────────────────────────────────────────────────────────

struct TurnWorker {
    services: Arc<Services>,
}

#[async_trait]
impl JobHandler for TurnWorker {
    async fn handle(&self, job: &Job) -> Result<(), String> {
        let request: TurnExecutionRequest =
            serde_json::from_value(job.payload.clone()).map_err(|e| e.to_string())?;
        let services = &self.services;

        let outcome = if services.config.features.streaming_drafts
            && services.transport.supports_drafts()
        {
            let streamer = DraftStreamer::new(
                Arc::clone(&services.transport),
                request.scope.chat_id,
                request.scope.thread_id,
                request.correlation_id.clone(),
            );
            services.executor.execute(&request, &streamer).await
        } else {
            services.executor.execute(&request, &NoopDraftSink).await
        };

        match outcome {
            Ok(turn) => {
                let opts = SendOptions::in_thread(request.scope.thread_id);
                if !turn.text.is_empty() {
                    send_text_chunked(&services.transport, request.scope.chat_id, &turn.text, &opts)
                        .await
                        .map_err(|e| e.to_string())?;
                }

                // Post one approval card per registered approval and track
                // its prompt message for countdown edits.
                if services.config.features.approval_ux {
                    for approval in &turn.registered_approvals {
                        let remaining = approval.remaining_secs(chrono::Utc::now());
                        let card = render_approval_card(approval, remaining);
                        match services
                            .transport
                            .send_message_with_keyboard(
                                request.scope.chat_id,
                                &card,
                                &approval_keyboard(approval),
                                &opts,
                            )
                            .await
                        {
                            Ok(message_id) => {
                                if let Err(e) = services
                                    .approvals
                                    .set_prompt_message(&approval.approval_id, message_id)
                                {
                                    warn!(approval_id = %approval.approval_id, error = %e,
                                        "failed to track prompt message");
                                }
                            }
                            Err(e) => {
                                warn!(approval_id = %approval.approval_id, error = %e,
                                    "failed to post approval card");
                            }
                        }
                    }
                }
                Ok(())
            }
            Err(AgentError::Lock(e)) => {
                // Backpressure: the queue retries this job.
                info!(correlation_id = %request.correlation_id, "turn deferred: {e}");
                Err(e.to_string())
            }
            Err(e) => {
                if job.attempts >= job.max_attempts {
                    // Final attempt: the user gets exactly one friendly line.
                    send_text_chunked(
                        &services.transport,
                        request.scope.chat_id,
                        USER_FACING_FAILURE,
                        &SendOptions::in_thread(request.scope.thread_id),
                    )
                    .await
                    .ok();
                }
                error!(correlation_id = %request.correlation_id, error = %e, "turn failed");
                Err(e.to_string())
            }
        }
    }
}

// ── Approval expiry ───────────────────────────────────────────────────────────

struct ApprovalTimeoutWorker {
    services: Arc<Services>,
}

#[async_trait]
impl JobHandler for ApprovalTimeoutWorker {
    async fn handle(&self, job: &Job) -> Result<(), String> {
        let Some(approval_id) = job.payload.get("approval_id").and_then(|v| v.as_str()) else {
            return Err("timeout job without approval_id".into());
        };

        let expired = self
            .services
            .approvals
            .expire_if_due(approval_id)
            .map_err(|e| e.to_string())?;
        let Some(approval) = expired else {
            // Decided in time, or not yet due. Nothing to do.
            return Ok(());
        };

        info!(approval_id, "approval expired");
        let card = render_expired_card(&approval);
        if let Some(message_id) = approval.prompt_message_id {
            edit_text_quiet(
                &self.services.transport,
                approval.chat_id,
                message_id,
                &card,
                None,
            )
            .await
            .ok();
        }
        send_text_chunked(
            &self.services.transport,
            approval.chat_id,
            &format!(
                "The pending approval for {} expired without a decision.",
                approval.tool_name
            ),
            &SendOptions::default(),
        )
        .await
        .ok();
        Ok(())
    }
}

// ── Approval countdown ────────────────────────────────────────────────────────

struct CountdownWorker {
    services: Arc<Services>,
}

#[async_trait]
impl JobHandler for CountdownWorker {
    async fn handle(&self, job: &Job) -> Result<(), String> {
        let Some(approval_id) = job.payload.get("approval_id").and_then(|v| v.as_str()) else {
            return Err("countdown job without approval_id".into());
        };
        let tick = job.payload.get("tick").and_then(|v| v.as_u64()).unwrap_or(1);

        let state = self
            .services
            .approvals
            .countdown_state(approval_id)
            .map_err(|e| e.to_string())?;
        let Some((approval, remaining)) = state else {
            // Settled or expired: the countdown stops rescheduling itself.
            return Ok(());
        };

        if let Some(message_id) = approval.prompt_message_id {
            edit_text_quiet(
                &self.services.transport,
                approval.chat_id,
                message_id,
                &render_approval_card(&approval, remaining),
                Some(&approval_keyboard(&approval)),
            )
            .await
            .ok();
        }

        self.services
            .approvals
            .reschedule_countdown(&approval, tick, remaining)
            .map_err(|e| e.to_string())
    }
}

// ── Dead letters ──────────────────────────────────────────────────────────────

struct DeadLetterWorker;

#[async_trait]
impl JobHandler for DeadLetterWorker {
    async fn handle(&self, job: &Job) -> Result<(), String> {
        error!(
            original_queue = %job.payload.get("queue").and_then(|v| v.as_str()).unwrap_or("?"),
            original_job = %job.payload.get("job_id").and_then(|v| v.as_str()).unwrap_or("?"),
            reason = %job.payload.get("reason").and_then(|v| v.as_str()).unwrap_or("?"),
            correlation_id = %job
                .payload
                .get("correlation_id")
                .and_then(|v| v.as_str())
                .unwrap_or("-"),
            "job dead-lettered; inspect and replay via /internal/replay-update"
        );
        Ok(())
    }
}
