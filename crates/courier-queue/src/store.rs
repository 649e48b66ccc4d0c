use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{QueueError, Result};
use crate::types::{queue_spec, DeadLetter, Job, QUEUE_DEAD_LETTER};

/// Retry backoff: base 1 s, factor 2. `attempts` counts deliveries already
/// made, so the first retry waits 1 s, the second 2 s, then 4 s, 8 s.
pub fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_secs(1u64 << (attempts.saturating_sub(1)).min(10))
}

/// Outcome of an enqueue attempt with a custom job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { job_id: String },
    /// A job with this id already exists: producer-side dedupe, no-op.
    Duplicate { job_id: String },
}

/// Durable job store shared by producers and the polling engine.
pub struct QueueStore {
    conn: Mutex<Connection>,
}

impl QueueStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a job for immediate delivery.
    pub fn enqueue(
        &self,
        queue: &str,
        job_id: Option<&str>,
        payload: &serde_json::Value,
        correlation_id: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        self.enqueue_delayed(queue, job_id, payload, Duration::ZERO, correlation_id)
    }

    /// Insert a job scheduled `delay` from now. A custom `job_id` dedupes:
    /// inserting an id that already exists is a no-op.
    pub fn enqueue_delayed(
        &self,
        queue: &str,
        job_id: Option<&str>,
        payload: &serde_json::Value,
        delay: Duration,
        correlation_id: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        let spec = queue_spec(queue).ok_or_else(|| QueueError::UnknownQueue {
            name: queue.to_string(),
        })?;
        let id = job_id
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let run_at = (now + chrono::Duration::from_std(delay).unwrap_or_default()).to_rfc3339();
        let now_str = now.to_rfc3339();
        let payload_json = serde_json::to_string(payload)?;

        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO queue_jobs
             (id, queue, payload, status, attempts, max_attempts, run_at,
              last_error, correlation_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, NULL, ?6, ?7, ?7)",
            rusqlite::params![
                id,
                queue,
                payload_json,
                spec.max_attempts,
                run_at,
                correlation_id,
                now_str
            ],
        )?;

        if inserted == 0 {
            return Ok(EnqueueOutcome::Duplicate { job_id: id });
        }
        Ok(EnqueueOutcome::Enqueued { job_id: id })
    }

    /// Claim the oldest due job on `queue`, marking it running and bumping
    /// its attempt count. Returns `None` when nothing is due.
    pub fn claim_due(&self, queue: &str) -> Result<Option<Job>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();

        let row: Option<(String, String, u32, u32, String, Option<String>, String)> = {
            let mut stmt = conn.prepare_cached(
                "SELECT id, payload, attempts, max_attempts, run_at, correlation_id, created_at
                 FROM queue_jobs
                 WHERE queue = ?1 AND status = 'pending' AND run_at <= ?2
                 ORDER BY run_at, created_at
                 LIMIT 1",
            )?;
            stmt.query_row(rusqlite::params![queue, now], |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
        };

        let Some((id, payload_json, attempts, max_attempts, run_at, correlation_id, created_at)) =
            row
        else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE queue_jobs SET status = 'running', attempts = attempts + 1, updated_at = ?2
             WHERE id = ?1",
            rusqlite::params![id, now],
        )?;

        Ok(Some(Job {
            id,
            queue: queue.to_string(),
            payload: serde_json::from_str(&payload_json)?,
            attempts: attempts + 1,
            max_attempts,
            run_at: parse_ts(&run_at),
            correlation_id,
            created_at: parse_ts(&created_at),
        }))
    }

    /// Delete a completed job. Its id becomes reusable.
    pub fn complete(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM queue_jobs WHERE id = ?1", [job_id])?;
        if n == 0 {
            return Err(QueueError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    /// Record a failed delivery. Within budget the job goes back to pending
    /// with exponential backoff; past budget it moves to the dead-letter
    /// table and (except for the dead-letter queue itself) is re-surfaced
    /// as a `retry-deadletter` job.
    pub fn fail(&self, job: &Job, error: &str) -> Result<()> {
        let now = Utc::now();
        if job.attempts < job.max_attempts {
            let delay = backoff_delay(job.attempts);
            let run_at = (now + chrono::Duration::from_std(delay).unwrap_or_default()).to_rfc3339();
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE queue_jobs
                 SET status = 'pending', run_at = ?2, last_error = ?3, updated_at = ?4
                 WHERE id = ?1",
                rusqlite::params![job.id, run_at, error, now.to_rfc3339()],
            )?;
            info!(
                job_id = %job.id,
                queue = %job.queue,
                attempt = job.attempts,
                retry_in_secs = delay.as_secs(),
                "job failed, retrying"
            );
            return Ok(());
        }

        // Attempt budget exhausted: park the payload.
        {
            let conn = self.conn.lock().unwrap();
            let payload_json = serde_json::to_string(&job.payload)?;
            conn.execute(
                "INSERT INTO dead_letters
                 (job_id, queue, payload, reason, correlation_id, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    job.id,
                    job.queue,
                    payload_json,
                    error,
                    job.correlation_id,
                    job.attempts,
                    now.to_rfc3339()
                ],
            )?;
            conn.execute("DELETE FROM queue_jobs WHERE id = ?1", [&job.id])?;
        }
        warn!(
            job_id = %job.id,
            queue = %job.queue,
            attempts = job.attempts,
            reason = %error,
            "job dead-lettered"
        );

        // Surface the dead letter for the investigation worker. The
        // dead-letter queue never feeds itself.
        if job.queue != QUEUE_DEAD_LETTER {
            let notice = serde_json::json!({
                "job_id": job.id,
                "queue": job.queue,
                "reason": error,
                "correlation_id": job.correlation_id,
            });
            self.enqueue(
                QUEUE_DEAD_LETTER,
                None,
                &notice,
                job.correlation_id.as_deref(),
            )?;
        }
        Ok(())
    }

    /// Jobs a crashed worker left in `running` go back to `pending` for
    /// immediate redelivery. Call once at startup, before the engine runs.
    pub fn recover_running_on_startup(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE queue_jobs SET status = 'pending', run_at = ?1, updated_at = ?1
             WHERE status = 'running'",
            [&now],
        )?;
        if n > 0 {
            warn!(count = n, "requeued jobs left running by a previous process");
        }
        Ok(n)
    }

    /// Number of jobs waiting or running on one queue.
    pub fn depth(&self, queue: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = ?1",
            [queue],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Total backlog across all queues, for readiness reporting.
    pub fn total_depth(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM queue_jobs", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// Most recent dead letters, newest first.
    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, queue, payload, reason, correlation_id, attempts, created_at
             FROM dead_letters ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, u32>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(
                |(id, job_id, queue, payload, reason, correlation_id, attempts, created_at)| {
                    Some(DeadLetter {
                        id,
                        job_id,
                        queue,
                        payload: serde_json::from_str(&payload).ok()?,
                        reason,
                        correlation_id,
                        attempts,
                        created_at: parse_ts(&created_at),
                    })
                },
            )
            .collect())
    }

    /// Manually replay a dead letter onto its original queue with a fresh
    /// attempt budget. The parked row is removed.
    pub fn replay_dead_letter(&self, dead_letter_id: i64) -> Result<EnqueueOutcome> {
        let letter = {
            let conn = self.conn.lock().unwrap();
            let row = conn
                .query_row(
                    "SELECT job_id, queue, payload, correlation_id
                     FROM dead_letters WHERE id = ?1",
                    [dead_letter_id],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Err(QueueError::JobNotFound {
                        id: dead_letter_id.to_string(),
                    }),
                    other => Err(other.into()),
                })?;
            conn.execute("DELETE FROM dead_letters WHERE id = ?1", [dead_letter_id])?;
            row
        };

        let (job_id, queue, payload_json, correlation_id) = letter;
        let payload: serde_json::Value = serde_json::from_str(&payload_json)?;
        self.enqueue(&queue, Some(&job_id), &payload, correlation_id.as_deref())
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
