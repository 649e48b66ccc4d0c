use rusqlite::Connection;

use crate::error::Result;

/// Initialise the queue schema in `conn`.
///
/// Creates the `queue_jobs` and `dead_letters` tables (idempotent) and an
/// index covering the polling query so claims stay cheap under load.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queue_jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            queue           TEXT    NOT NULL,
            payload         TEXT    NOT NULL,   -- opaque JSON
            status          TEXT    NOT NULL DEFAULT 'pending',
            attempts        INTEGER NOT NULL DEFAULT 0,
            max_attempts    INTEGER NOT NULL,
            run_at          TEXT    NOT NULL,   -- ISO-8601 delivery time
            last_error      TEXT,
            correlation_id  TEXT,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- Efficient claims: WHERE queue=? AND status='pending' AND run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_poll
            ON queue_jobs (queue, status, run_at);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id          TEXT    NOT NULL,
            queue           TEXT    NOT NULL,
            payload         TEXT    NOT NULL,
            reason          TEXT    NOT NULL,
            correlation_id  TEXT,
            attempts        INTEGER NOT NULL,
            created_at      TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
