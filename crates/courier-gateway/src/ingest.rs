//! Ingestion pipeline: transport → dedupe → persist → enqueue.
//!
//! Both run modes (webhook push and long-poll pull) funnel through
//! `Ingestor::ingest`. The durable insert is the acknowledgement point; a
//! failed enqueue leaves the row in `received` for the recovery sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use courier_core::config::{RECOVERY_SWEEP_BATCH, RECOVERY_SWEEP_INTERVAL_SECS};
use courier_queue::types::QUEUE_UPDATES;
use courier_queue::QueueStore;
use courier_store::types::UpdateStatus;
use courier_store::UpdateStore;

/// What happened to an inbound update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Persisted (and, when the queue cooperated, enqueued).
    Accepted { update_id: i64 },
    /// Already seen; the caller acks and stops.
    Duplicate { update_id: i64 },
    /// No numeric `update_id` in the payload.
    MissingId,
}

pub struct Ingestor {
    updates: Arc<UpdateStore>,
    queue: Arc<QueueStore>,
}

impl Ingestor {
    pub fn new(updates: Arc<UpdateStore>, queue: Arc<QueueStore>) -> Self {
        Self { updates, queue }
    }

    /// Persist-then-enqueue. Never fails on a queue error: durability of
    /// the insert is the contract, the sweep covers the rest.
    pub fn ingest(&self, payload: &serde_json::Value) -> anyhow::Result<IngestOutcome> {
        let Some(update_id) = payload.get("update_id").and_then(|v| v.as_i64()) else {
            return Ok(IngestOutcome::MissingId);
        };

        let inserted = self.updates.try_insert(update_id, payload)?;
        if !inserted.inserted {
            return Ok(IngestOutcome::Duplicate { update_id });
        }

        self.enqueue_update(update_id);
        Ok(IngestOutcome::Accepted { update_id })
    }

    /// Enqueue `update-<id>` and advance the row to `enqueued`. Queue
    /// failures are logged; the row stays `received`.
    fn enqueue_update(&self, update_id: i64) {
        let payload = serde_json::json!({ "update_id": update_id });
        match self.queue.enqueue(
            QUEUE_UPDATES,
            Some(&format!("update-{update_id}")),
            &payload,
            None,
        ) {
            Ok(_) => {
                if let Err(e) = self
                    .updates
                    .mark_status(update_id, UpdateStatus::Enqueued, None)
                {
                    warn!(update_id, error = %e, "failed to mark update enqueued");
                }
            }
            Err(e) => {
                warn!(update_id, error = %e, "enqueue failed, leaving update for recovery sweep");
            }
        }
    }

    /// One sweep pass: re-enqueue everything stuck in `received`.
    /// Returns the number of rows re-enqueued.
    pub fn sweep_once(&self) -> anyhow::Result<usize> {
        let stuck = self.updates.list_received_for_recovery(RECOVERY_SWEEP_BATCH)?;
        let mut recovered = 0;

        for update in stuck {
            let update_id = update.update_id;
            let payload = serde_json::json!({ "update_id": update_id });
            match self.queue.enqueue(
                QUEUE_UPDATES,
                Some(&format!("update-{update_id}")),
                &payload,
                None,
            ) {
                Ok(_) => {
                    self.updates
                        .mark_status(update_id, UpdateStatus::Enqueued, None)?;
                    recovered += 1;
                }
                Err(e) => {
                    // Stay `received`; the next tick retries.
                    self.updates
                        .mark_status(update_id, UpdateStatus::Received, None)?;
                    warn!(update_id, error = %e, "recovery enqueue failed");
                }
            }
        }

        if recovered > 0 {
            info!(recovered, "recovery sweep re-enqueued stuck updates");
        }
        Ok(recovered)
    }

    /// Run the sweep every 5 s from service start until shutdown.
    pub async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(RECOVERY_SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once() {
                        error!("recovery sweep error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("recovery sweep stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_queue::EnqueueOutcome;
    use rusqlite::Connection;

    fn setup() -> (Ingestor, Arc<UpdateStore>, Arc<QueueStore>) {
        let updates = Arc::new(UpdateStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let queue = Arc::new(QueueStore::new(Connection::open_in_memory().unwrap()).unwrap());
        (
            Ingestor::new(Arc::clone(&updates), Arc::clone(&queue)),
            updates,
            queue,
        )
    }

    #[test]
    fn first_ingest_persists_and_enqueues() {
        let (ingestor, updates, queue) = setup();
        let payload = serde_json::json!({"update_id": 42, "message": {"text": "hi"}});

        let outcome = ingestor.ingest(&payload).unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted { update_id: 42 });

        let record = updates.get(42).unwrap().unwrap();
        assert_eq!(record.status, UpdateStatus::Enqueued);
        assert_eq!(queue.depth(QUEUE_UPDATES).unwrap(), 1);
    }

    #[test]
    fn duplicate_ingest_is_detected_and_not_reenqueued() {
        let (ingestor, _updates, queue) = setup();
        let payload = serde_json::json!({"update_id": 42});

        ingestor.ingest(&payload).unwrap();
        let second = ingestor.ingest(&payload).unwrap();
        assert_eq!(second, IngestOutcome::Duplicate { update_id: 42 });
        assert_eq!(queue.depth(QUEUE_UPDATES).unwrap(), 1);
    }

    #[test]
    fn missing_update_id_is_rejected_without_persisting() {
        let (ingestor, updates, _queue) = setup();
        let outcome = ingestor
            .ingest(&serde_json::json!({"message": {"text": "hi"}}))
            .unwrap();
        assert_eq!(outcome, IngestOutcome::MissingId);
        assert!(updates.list_received_for_recovery(10).unwrap().is_empty());
    }

    #[test]
    fn sweep_reenqueues_stuck_updates() {
        let (ingestor, updates, queue) = setup();
        // Simulate an update persisted while the queue was down: insert
        // directly without enqueuing.
        updates
            .try_insert(7, &serde_json::json!({"update_id": 7}))
            .unwrap();
        assert_eq!(updates.get(7).unwrap().unwrap().status, UpdateStatus::Received);

        let recovered = ingestor.sweep_once().unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(updates.get(7).unwrap().unwrap().status, UpdateStatus::Enqueued);
        assert_eq!(queue.depth(QUEUE_UPDATES).unwrap(), 1);
    }

    #[test]
    fn sweep_dedupes_against_existing_job() {
        let (ingestor, updates, queue) = setup();
        ingestor.ingest(&serde_json::json!({"update_id": 9})).unwrap();
        // Force the row back to received (as if the status write raced).
        updates
            .mark_status(9, UpdateStatus::Received, None)
            .unwrap();

        ingestor.sweep_once().unwrap();
        // The queue still holds exactly one job for update-9.
        assert_eq!(queue.depth(QUEUE_UPDATES).unwrap(), 1);
        let outcome = queue
            .enqueue(QUEUE_UPDATES, Some("update-9"), &serde_json::json!({}), None)
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Duplicate { .. }));
    }
}
