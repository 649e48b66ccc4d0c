//! User defaults and per-chat preference overrides.

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;

use courier_core::types::{EffectivePreferences, Preferences};

use crate::db::init_db;
use crate::error::Result;

/// A preference field addressable from the settings UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefField {
    ResponseStyle,
    RiskProfile,
    Network,
}

impl PrefField {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "response_style" | "style" => Some(PrefField::ResponseStyle),
            "risk_profile" | "risk" => Some(PrefField::RiskProfile),
            "network" => Some(PrefField::Network),
            _ => None,
        }
    }

    fn column(self) -> &'static str {
        match self {
            PrefField::ResponseStyle => "response_style",
            PrefField::RiskProfile => "risk_profile",
            PrefField::Network => "network",
        }
    }
}

pub struct PreferenceStore {
    conn: Mutex<Connection>,
}

impl PreferenceStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn user_prefs(&self, user_id: i64) -> Result<Preferences> {
        let conn = self.conn.lock().unwrap();
        query_prefs(
            &conn,
            "SELECT response_style, risk_profile, network FROM user_prefs WHERE user_id = ?1",
            user_id,
        )
    }

    pub fn chat_prefs(&self, chat_id: i64) -> Result<Preferences> {
        let conn = self.conn.lock().unwrap();
        query_prefs(
            &conn,
            "SELECT response_style, risk_profile, network FROM chat_prefs WHERE chat_id = ?1",
            chat_id,
        )
    }

    /// Effective preferences for a turn: chat override ?? user default ??
    /// system default.
    pub fn effective(&self, user_id: i64, chat_id: i64) -> Result<EffectivePreferences> {
        let user = self.user_prefs(user_id)?;
        let chat = self.chat_prefs(chat_id)?;
        Ok(EffectivePreferences::resolve(&chat, &user))
    }

    pub fn set_user_field(&self, user_id: i64, field: PrefField, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO user_prefs (user_id, {col}, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET {col} = ?2, updated_at = ?3",
                col = field.column()
            ),
            rusqlite::params![user_id, value, now],
        )?;
        Ok(())
    }

    pub fn set_chat_field(&self, chat_id: i64, field: PrefField, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO chat_prefs (chat_id, {col}, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(chat_id) DO UPDATE SET {col} = ?2, updated_at = ?3",
                col = field.column()
            ),
            rusqlite::params![chat_id, value, now],
        )?;
        Ok(())
    }

    /// The user's linked wallet address, if any.
    pub fn wallet_address(&self, user_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT wallet_address FROM user_prefs WHERE user_id = ?1",
            [user_id],
            |r| r.get::<_, Option<String>>(0),
        ) {
            Ok(w) => Ok(w),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_wallet_address(&self, user_id: i64, address: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_prefs (user_id, wallet_address, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET wallet_address = ?2, updated_at = ?3",
            rusqlite::params![user_id, address, now],
        )?;
        Ok(())
    }
}

fn query_prefs(conn: &Connection, sql: &str, key: i64) -> Result<Preferences> {
    match conn.query_row(sql, [key], |r| {
        Ok((
            r.get::<_, Option<String>>(0)?,
            r.get::<_, Option<String>>(1)?,
            r.get::<_, Option<String>>(2)?,
        ))
    }) {
        Ok((style, risk, network)) => Ok(Preferences {
            response_style: style.and_then(|s| s.parse().ok()),
            risk_profile: risk.and_then(|s| s.parse().ok()),
            network,
        }),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Preferences::default()),
        Err(e) => Err(e.into()),
    }
}
