use crate::{LocalStore, sqlite_error};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use t8d_core::T8dResult;
use t8d_core::time::Millis;

pub(crate) const KEY_WATERMARK: &str = "watermark";
const KEY_SYNC_ENABLED: &str = "sync_enabled";
const KEY_CREDENTIAL: &str = "credential";
const KEY_LAST_ROUND_AT: &str = "last_round_at";
const KEY_LAST_ROUND_STATUS: &str = "last_round_status";
const KEY_LAST_ERROR: &str = "last_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Ok,
    Failed,
}

impl RoundStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }
}

/// Everything `t8d sync status` reports.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub watermark: Option<Millis>,
    pub pending: usize,
    pub has_credential: bool,
    pub last_round_at: Option<Millis>,
    pub last_round_status: Option<String>,
    pub last_error: Option<String>,
}

impl LocalStore {
    pub fn watermark(&self) -> T8dResult<Option<Millis>> {
        Ok(self
            .read_setting(KEY_WATERMARK)?
            .and_then(|raw| raw.parse::<Millis>().ok()))
    }

    pub fn set_watermark(&self, watermark: Millis) -> T8dResult<()> {
        self.write(KEY_WATERMARK, &watermark.to_string())
    }

    pub fn sync_enabled(&self) -> T8dResult<bool> {
        Ok(self.read_setting(KEY_SYNC_ENABLED)?.as_deref() == Some("1"))
    }

    pub fn set_sync_enabled(&self, enabled: bool) -> T8dResult<()> {
        self.write(KEY_SYNC_ENABLED, if enabled { "1" } else { "0" })
    }

    /// Whether local writes are queued for the server: sync is on, this
    /// device has completed a round before, or entries are still waiting to
    /// go out. A pending entry must be superseded by every later change to
    /// its row, or a stale copy would be pushed on the next round.
    pub fn records_outbox(&self) -> T8dResult<bool> {
        Ok(self.sync_enabled()? || self.watermark()?.is_some() || self.pending_count()? > 0)
    }

    pub fn credential(&self) -> T8dResult<Option<String>> {
        Ok(self
            .read_setting(KEY_CREDENTIAL)?
            .filter(|value| !value.trim().is_empty()))
    }

    pub fn set_credential(&self, token: &str) -> T8dResult<()> {
        self.write(KEY_CREDENTIAL, token.trim())
    }

    pub fn clear_credential(&self) -> T8dResult<()> {
        self.remove_setting(KEY_CREDENTIAL)
    }

    pub fn mark_round(&self, at: Millis, status: RoundStatus, error: Option<&str>) -> T8dResult<()> {
        self.write(KEY_LAST_ROUND_AT, &at.to_string())?;
        self.write(KEY_LAST_ROUND_STATUS, status.as_str())?;
        match error {
            Some(message) => self.write(KEY_LAST_ERROR, message),
            None => self.remove_setting(KEY_LAST_ERROR),
        }
    }

    pub fn sync_status(&self) -> T8dResult<SyncStatus> {
        Ok(SyncStatus {
            enabled: self.sync_enabled()?,
            watermark: self.watermark()?,
            pending: self.pending_count()?,
            has_credential: self.credential()?.is_some(),
            last_round_at: self
                .read_setting(KEY_LAST_ROUND_AT)?
                .and_then(|raw| raw.parse::<Millis>().ok()),
            last_round_status: self.read_setting(KEY_LAST_ROUND_STATUS)?,
            last_error: self.read_setting(KEY_LAST_ERROR)?,
        })
    }

    fn read_setting(&self, key: &str) -> T8dResult<Option<String>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|err| sqlite_error(&format!("read setting '{key}'"), &self.db_path, err))
    }

    fn write(&self, key: &str, value: &str) -> T8dResult<()> {
        let conn = self.connection()?;
        write_setting(&conn, &self.db_path, key, value)
    }

    fn remove_setting(&self, key: &str) -> T8dResult<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])
            .map_err(|err| sqlite_error(&format!("remove setting '{key}'"), &self.db_path, err))?;
        Ok(())
    }
}

pub(crate) fn write_setting(
    conn: &Connection,
    db_path: &Path,
    key: &str,
    value: &str,
) -> T8dResult<()> {
    conn.execute(
        "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, Utc::now().to_rfc3339()],
    )
    .map_err(|err| sqlite_error(&format!("write setting '{key}'"), db_path, err))?;
    Ok(())
}
