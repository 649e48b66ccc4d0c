//! Session and message persistence for turn continuation.

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::instrument;
use uuid::Uuid;

use courier_core::types::{ChatScope, MessagePart, Role};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::{parse_ts, SessionRecord, StoredMessage};

pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Return the session for `scope`, creating it if absent (upsert).
    #[instrument(skip(self), fields(scope = %scope))]
    pub fn get_or_create(&self, scope: &ChatScope) -> Result<SessionRecord> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO sessions
             (id, chat_id, user_id, thread_id, state, last_message_at, created_at)
             VALUES (?1, ?2, ?3, ?4, '{}', NULL, ?5)",
            rusqlite::params![id, scope.chat_id, scope.user_id, scope.thread_id, now],
        )?;

        // Read back; handles the race where two threads insert simultaneously.
        let session = conn.query_row(
            "SELECT id, chat_id, user_id, thread_id, state, last_message_at, created_at
             FROM sessions
             WHERE chat_id = ?1 AND user_id = ?2 AND ifnull(thread_id, -1) = ifnull(?3, -1)",
            rusqlite::params![scope.chat_id, scope.user_id, scope.thread_id],
            row_to_session,
        )?;
        Ok(session)
    }

    pub fn get_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT id, chat_id, user_id, thread_id, state, last_message_at, created_at
             FROM sessions WHERE id = ?1",
            [session_id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the opaque session state blob.
    pub fn update_state(&self, session_id: &str, state: &serde_json::Value) -> Result<()> {
        let state_json = serde_json::to_string(state)?;
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sessions SET state = ?2 WHERE id = ?1",
            rusqlite::params![session_id, state_json],
        )?;
        if n == 0 {
            return Err(StoreError::SessionNotFound {
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Append a message and bump the session's `last_message_at`.
    #[instrument(skip(self, parts), fields(session_id, role = %role))]
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        parts: &[MessagePart],
        correlation_id: &str,
    ) -> Result<StoredMessage> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let parts_json = serde_json::to_string(parts)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (session_id, role, parts, correlation_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![session_id, role.to_string(), parts_json, correlation_id, now_str],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE sessions SET last_message_at = ?2 WHERE id = ?1",
            rusqlite::params![session_id, now_str],
        )?;

        Ok(StoredMessage {
            id,
            session_id: session_id.to_string(),
            role,
            parts: parts.to_vec(),
            correlation_id: correlation_id.to_string(),
            created_at: now,
        })
    }

    /// The `limit` most recent messages, returned oldest-first: the slice
    /// replayed to the LLM. No summarization beyond this bound.
    pub fn load_recent(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, role, parts, correlation_id, created_at
             FROM messages
             WHERE session_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let mut messages: Vec<StoredMessage> = stmt
            .query_map(rusqlite::params![session_id, limit as i64], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        messages.reverse();
        Ok(messages)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let state_json: String = row.get(4)?;
    let last_message_at: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        thread_id: row.get(3)?,
        state: serde_json::from_str(&state_json).unwrap_or(serde_json::Value::Null),
        last_message_at: last_message_at.as_deref().map(parse_ts),
        created_at: parse_ts(&created_at),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role_str: String = row.get(2)?;
    let parts_json: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role_str.parse().unwrap_or(Role::User),
        parts: serde_json::from_str(&parts_json).unwrap_or_default(),
        correlation_id: row.get(4)?,
        created_at: parse_ts(&created_at),
    })
}
