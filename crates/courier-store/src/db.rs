use rusqlite::Connection;

use crate::error::Result;

/// Initialise the relational schema. Safe to call on every startup;
/// uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS processed_updates (
            update_id   INTEGER NOT NULL PRIMARY KEY,
            payload     TEXT    NOT NULL,   -- raw platform update, JSON
            status      TEXT    NOT NULL DEFAULT 'received',
            received_at TEXT    NOT NULL,
            handled_at  TEXT,
            error       TEXT
        ) STRICT;

        -- Recovery sweep: WHERE status='received' ORDER BY received_at
        CREATE INDEX IF NOT EXISTS idx_updates_status
            ON processed_updates (status, received_at);

        CREATE TABLE IF NOT EXISTS sessions (
            id              TEXT    NOT NULL PRIMARY KEY,
            chat_id         INTEGER NOT NULL,
            user_id         INTEGER NOT NULL,
            thread_id       INTEGER,
            state           TEXT    NOT NULL DEFAULT '{}',
            last_message_at TEXT,
            created_at      TEXT    NOT NULL
        ) STRICT;

        -- Exactly one session per (chat, user, thread). NULL thread ids
        -- would compare distinct, so the index coalesces them.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_scope
            ON sessions (chat_id, user_id, ifnull(thread_id, -1));

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id      TEXT    NOT NULL,
            role            TEXT    NOT NULL,
            parts           TEXT    NOT NULL,   -- JSON array of MessagePart
            correlation_id  TEXT    NOT NULL,
            created_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages (session_id, created_at, id);

        CREATE TABLE IF NOT EXISTS user_prefs (
            user_id        INTEGER NOT NULL PRIMARY KEY,
            response_style TEXT,
            risk_profile   TEXT,
            network        TEXT,
            wallet_address TEXT,
            updated_at     TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS chat_prefs (
            chat_id        INTEGER NOT NULL PRIMARY KEY,
            response_style TEXT,
            risk_profile   TEXT,
            network        TEXT,
            updated_at     TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
