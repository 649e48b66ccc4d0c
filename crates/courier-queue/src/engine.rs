//! Polling engine: claims due jobs and dispatches them to handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::store::QueueStore;
use crate::types::{Job, QUEUES};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Implemented once per queue. Handlers must be idempotent: delivery is
/// at-least-once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one job. An `Err` counts the attempt and either backs off
    /// or dead-letters per the queue's budget.
    async fn handle(&self, job: &Job) -> std::result::Result<(), String>;
}

/// Drives all registered queues until shutdown. Each queue gets its own set
/// of worker tasks, capped at the queue's configured concurrency.
pub struct QueueEngine {
    store: Arc<QueueStore>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl QueueEngine {
    pub fn new(store: Arc<QueueStore>) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a queue. Queues without a handler are not
    /// polled.
    pub fn register(&mut self, queue: &'static str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(queue, handler);
    }

    /// Spawn the worker tasks. Returns once all workers have observed
    /// shutdown and drained their in-flight job.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut workers = Vec::new();

        for spec in QUEUES {
            let Some(handler) = self.handlers.get(spec.name) else {
                continue;
            };
            info!(
                queue = spec.name,
                concurrency = spec.concurrency,
                "queue workers starting"
            );
            for worker_idx in 0..spec.concurrency {
                let store = Arc::clone(&self.store);
                let handler = Arc::clone(handler);
                let mut shutdown = shutdown.clone();
                let queue = spec.name;
                workers.push(tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match store.claim_due(queue) {
                            Ok(Some(job)) => {
                                run_one(&store, handler.as_ref(), &job).await;
                                // Immediately look for more work.
                                continue;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                error!(queue, worker_idx, error = %e, "queue claim failed");
                            }
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    debug!(queue, worker_idx, "queue worker stopped");
                }));
            }
        }

        for w in workers {
            let _ = w.await;
        }
        info!("queue engine stopped");
    }
}

async fn run_one(store: &QueueStore, handler: &dyn JobHandler, job: &Job) {
    debug!(job_id = %job.id, queue = %job.queue, attempt = job.attempts, "job started");
    match handler.handle(job).await {
        Ok(()) => {
            if let Err(e) = store.complete(&job.id) {
                error!(job_id = %job.id, error = %e, "failed to complete job");
            }
        }
        Err(reason) => {
            if let Err(e) = store.fail(job, &reason) {
                error!(job_id = %job.id, error = %e, "failed to record job failure");
            }
        }
    }
}
