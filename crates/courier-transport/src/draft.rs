//! Throttled live-draft streaming.
//!
//! Wraps the transport's optional draft surface as a `DraftSink`. Sends
//! are chained through one async mutex so exactly one is in flight, with
//! a minimum inter-send gap; unchanged or oversized snapshots are skipped.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use courier_agent::DraftSink;
use courier_core::config::{DRAFT_MIN_INTERVAL_MS, TRANSPORT_MESSAGE_MAX};

use crate::types::{ChatTransport, SendOptions};

struct DraftState {
    buffer: String,
    last_sent: String,
    last_send_at: Option<Instant>,
    sent_anything: bool,
}

pub struct DraftStreamer {
    transport: Arc<dyn ChatTransport>,
    chat_id: i64,
    thread_id: Option<i64>,
    draft_id: String,
    state: tokio::sync::Mutex<DraftState>,
}

impl DraftStreamer {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        chat_id: i64,
        thread_id: Option<i64>,
        draft_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            chat_id,
            thread_id,
            draft_id: draft_id.into(),
            state: tokio::sync::Mutex::new(DraftState {
                buffer: String::new(),
                last_sent: String::new(),
                last_send_at: None,
                sent_anything: false,
            }),
        }
    }

    async fn try_send(&self, state: &mut DraftState, force: bool) {
        if !force {
            if let Some(at) = state.last_send_at {
                if at.elapsed() < Duration::from_millis(DRAFT_MIN_INTERVAL_MS) {
                    return;
                }
            }
        }
        // Skip unchanged or oversized snapshots.
        if state.buffer == state.last_sent || state.buffer.len() > TRANSPORT_MESSAGE_MAX {
            return;
        }

        let snapshot = state.buffer.clone();
        let result = self
            .transport
            .send_draft(
                self.chat_id,
                &self.draft_id,
                &snapshot,
                &SendOptions::in_thread(self.thread_id),
            )
            .await;
        state.last_send_at = Some(Instant::now());
        match result {
            Ok(()) => {
                state.last_sent = snapshot;
                state.sent_anything = true;
            }
            Err(e) => {
                // Draft failures never fail the turn.
                debug!(chat_id = self.chat_id, error = %e, "draft send failed");
            }
        }
    }
}

#[async_trait]
impl DraftSink for DraftStreamer {
    async fn push_delta(&self, text: &str) {
        let mut state = self.state.lock().await;
        state.buffer.push_str(text);
        self.try_send(&mut state, false).await;
    }

    async fn finish(&self, final_text: Option<&str>) -> bool {
        let mut state = self.state.lock().await;
        if let Some(text) = final_text {
            state.buffer = text.to_string();
        }
        self.try_send(&mut state, true).await;
        state.sent_anything
    }
}
