use rusqlite::Connection;

use crate::error::Result;

/// Initialise the approvals schema (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS approvals (
            approval_id       TEXT    NOT NULL PRIMARY KEY,
            callback_token    TEXT    NOT NULL UNIQUE,
            session_id        TEXT    NOT NULL,
            chat_id           INTEGER NOT NULL,
            user_id           INTEGER NOT NULL,
            correlation_id    TEXT    NOT NULL,
            tool_name         TEXT    NOT NULL,
            tool_call_id      TEXT    NOT NULL,
            tool_input        TEXT    NOT NULL,   -- JSON
            risk_level        TEXT    NOT NULL,
            risk_confidence   TEXT    NOT NULL,
            status            TEXT    NOT NULL DEFAULT 'requested',
            expires_at        TEXT    NOT NULL,
            decided_by        INTEGER,
            decided_at        TEXT,
            prompt_message_id INTEGER,
            created_at        TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_approvals_session
            ON approvals (session_id, status);
        ",
    )?;
    Ok(())
}
