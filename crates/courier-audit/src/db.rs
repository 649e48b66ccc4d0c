use rusqlite::Connection;

use crate::error::Result;

/// Initialise the audit schema. Rows are append-only: nothing in the
/// runtime ever updates or deletes them.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS audit_events (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            actor_type      TEXT NOT NULL,
            actor_id        TEXT NOT NULL,
            event_type      TEXT NOT NULL,
            metadata        TEXT NOT NULL,   -- canonical JSON
            correlation_id  TEXT,
            created_at      TEXT NOT NULL,   -- ISO-8601
            hash_chain      TEXT NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_audit_correlation
            ON audit_events (correlation_id);
        ",
    )?;
    Ok(())
}
