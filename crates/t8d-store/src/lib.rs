//! Local transactional store for one device.
//!
//! Tasks, task lists, the outbox and a handful of settings scalars live in a
//! single SQLite file under `.t8d/state.db`. Every public operation opens its
//! own connection; operations that must be atomic run in one transaction.

mod outbox;
mod rows;
mod settings;

pub use outbox::{OutboxEntry, OutboxOperation, OutboxPayload, OutboxRecord, PendingBatch};
pub use rows::{ApplySummary, LocalBatch, RemoteApply};
pub use settings::{RoundStatus, SyncStatus};

use rusqlite::{Connection, Error as SqlError, ErrorCode};
use std::fs;
use std::path::{Path, PathBuf};
use t8d_core::{T8dError, T8dResult};
use t8d_fs::WorkspacePaths;

#[derive(Debug, Clone)]
pub struct LocalStore {
    db_path: PathBuf,
}

impl LocalStore {
    pub fn from_workspace(paths: &WorkspacePaths) -> T8dResult<Self> {
        Self::open(&paths.state_db_path)
    }

    pub fn open(db_path: &Path) -> T8dResult<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                T8dError::io(format!(
                    "failed to create state directory '{}': {}",
                    parent.display(),
                    err
                ))
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };

        let conn = store.connection()?;
        store.initialize_schema(&conn)?;

        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connection(&self) -> T8dResult<Connection> {
        Connection::open(&self.db_path)
            .map_err(|err| sqlite_error("open state database", &self.db_path, err))
    }

    fn initialize_schema(&self, conn: &Connection) -> T8dResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS task_lists (
                 id TEXT PRIMARY KEY,
                 sort_order REAL NOT NULL,
                 last_modified INTEGER NOT NULL,
                 payload_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS task_lists_by_order ON task_lists (sort_order);
             CREATE TABLE IF NOT EXISTS tasks (
                 id TEXT PRIMARY KEY,
                 list_id TEXT NOT NULL,
                 parent_id TEXT,
                 status TEXT NOT NULL,
                 sort_order REAL NOT NULL,
                 last_modified INTEGER NOT NULL,
                 payload_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS tasks_by_status ON tasks (status);
             CREATE INDEX IF NOT EXISTS tasks_by_parent ON tasks (parent_id);
             CREATE INDEX IF NOT EXISTS tasks_by_list ON tasks (list_id, sort_order);
             CREATE TABLE IF NOT EXISTS outbox (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 created_at INTEGER NOT NULL,
                 kind TEXT NOT NULL,
                 operation TEXT NOT NULL,
                 target_id TEXT NOT NULL,
                 payload_json TEXT
             );
             CREATE TABLE IF NOT EXISTS settings (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(|err| sqlite_error("initialize schema", &self.db_path, err))?;

        Ok(())
    }
}

fn sqlite_error(action: &str, db_path: &Path, err: SqlError) -> T8dError {
    if let SqlError::SqliteFailure(code, message) = &err
        && (code.code == ErrorCode::DatabaseCorrupt || code.code == ErrorCode::NotADatabase)
    {
        let detail = message.as_deref().unwrap_or("sqlite reported corruption");
        return T8dError::io(format!(
            "failed to {action}: state database '{}' is corrupted ({detail}); remove '.t8d/state.db' and run `t8d sync bootstrap` to rebuild local data",
            db_path.display()
        ));
    }

    T8dError::io(format!(
        "failed to {action} using state database '{}': {}",
        db_path.display(),
        err
    ))
}

fn encode_json<T: serde::Serialize>(what: &str, value: &T) -> T8dResult<String> {
    serde_json::to_string(value).map_err(|err| T8dError::io(format!("failed to encode {what}: {err}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    what: &str,
    db_path: &Path,
    raw: &str,
) -> T8dResult<T> {
    serde_json::from_str::<T>(raw).map_err(|err| {
        T8dError::io(format!(
            "failed to parse stored {what} in '{}': {}",
            db_path.display(),
            err
        ))
    })
}
