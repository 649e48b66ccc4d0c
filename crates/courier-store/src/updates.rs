//! Idempotent persistence of platform updates.

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::instrument;

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::{parse_ts, ProcessedUpdate, UpdateStatus};

/// Result of `try_insert`: whether this call created the row.
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub inserted: bool,
    pub record: ProcessedUpdate,
}

pub struct UpdateStore {
    conn: Mutex<Connection>,
}

impl UpdateStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Atomic insert-or-ignore keyed by `update_id`. `inserted = false`
    /// means a duplicate delivery; callers MUST NOT re-enqueue.
    #[instrument(skip(self, payload), fields(update_id))]
    pub fn try_insert(&self, update_id: i64, payload: &serde_json::Value) -> Result<InsertOutcome> {
        let now = Utc::now().to_rfc3339();
        let payload_json = serde_json::to_string(payload)?;

        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_updates
             (update_id, payload, status, received_at, handled_at, error)
             VALUES (?1, ?2, 'received', ?3, NULL, NULL)",
            rusqlite::params![update_id, payload_json, now],
        )? > 0;

        // Read back covers both the fresh insert and the duplicate row.
        let record = query_update(&conn, update_id)?.ok_or(StoreError::UpdateNotFound { update_id })?;
        Ok(InsertOutcome { inserted, record })
    }

    pub fn get(&self, update_id: i64) -> Result<Option<ProcessedUpdate>> {
        let conn = self.conn.lock().unwrap();
        query_update(&conn, update_id)
    }

    /// Idempotent status update. Transitions are monotone: terminal rows
    /// (`processed`/`failed`) never change, and a row cannot move back to
    /// `received` from a terminal state. `received → received` is allowed
    /// for recovery retries.
    pub fn mark_status(
        &self,
        update_id: i64,
        status: UpdateStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let handled_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE processed_updates
             SET status = ?2, handled_at = COALESCE(?3, handled_at), error = ?4
             WHERE update_id = ?1
               AND status NOT IN ('processed', 'failed')",
            rusqlite::params![update_id, status.to_string(), handled_at, error],
        )?;
        Ok(())
    }

    /// Rows stuck in `received` (persisted but never enqueued), oldest
    /// first: the recovery sweep work list.
    pub fn list_received_for_recovery(&self, limit: usize) -> Result<Vec<ProcessedUpdate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT update_id, payload, status, received_at, handled_at, error
             FROM processed_updates
             WHERE status = 'received'
             ORDER BY received_at ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_update)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete terminal rows older than `days`. Returns the purge count.
    pub fn purge_older_than(&self, days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM processed_updates
             WHERE status IN ('processed', 'failed') AND received_at < ?1",
            [cutoff],
        )?;
        Ok(n)
    }
}

fn query_update(conn: &Connection, update_id: i64) -> Result<Option<ProcessedUpdate>> {
    let mut stmt = conn.prepare_cached(
        "SELECT update_id, payload, status, received_at, handled_at, error
         FROM processed_updates WHERE update_id = ?1",
    )?;
    match stmt.query_row([update_id], row_to_update) {
        Ok(u) => Ok(Some(u)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn row_to_update(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessedUpdate> {
    let payload_json: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let received_at: String = row.get(3)?;
    let handled_at: Option<String> = row.get(4)?;
    Ok(ProcessedUpdate {
        update_id: row.get(0)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        status: status_str.parse().unwrap_or(UpdateStatus::Received),
        received_at: parse_ts(&received_at),
        handled_at: handled_at.as_deref().map(parse_ts),
        error: row.get(5)?,
    })
}
