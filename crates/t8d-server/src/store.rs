//! Server-side persistence: accounts, bearer token digests and every
//! user's lists and tasks.
//!
//! Rows keep the pushed payload verbatim in `payload_json` next to the
//! columns the merge filters on. `server_modified` is the server clock value
//! of the merge that last wrote the row.

use crate::auth::{generate_token, hash_token};
use rusqlite::{
    Connection, Error as SqlError, ErrorCode, OptionalExtension, TransactionBehavior, params,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use t8d_api::{BootstrapResponse, MAX_ID_LEN};
use t8d_core::time::{Millis, now_millis};
use t8d_core::{T8dError, T8dResult, Task, TaskList};
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const CLOCK_KEY: &str = "clock";

#[derive(Debug, Clone)]
pub struct ServerStore {
    db_path: PathBuf,
}

impl ServerStore {
    pub fn open(db_path: &Path) -> T8dResult<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                T8dError::io(format!(
                    "failed to create database directory '{}': {}",
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

    pub(crate) fn connection(&self) -> T8dResult<Connection> {
        let conn = Connection::open(&self.db_path)
            .map_err(|err| sqlite_error("open server database", &self.db_path, err))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| sqlite_error("configure busy timeout", &self.db_path, err))?;
        Ok(conn)
    }

    fn initialize_schema(&self, conn: &Connection) -> T8dResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS users (
                 id TEXT PRIMARY KEY,
                 created_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS tokens (
                 token_hash TEXT PRIMARY KEY,
                 user_id TEXT NOT NULL REFERENCES users (id),
                 created_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS task_lists (
                 id TEXT PRIMARY KEY,
                 user_id TEXT NOT NULL,
                 last_modified INTEGER NOT NULL,
                 hash TEXT NOT NULL,
                 is_deleted INTEGER NOT NULL,
                 server_modified INTEGER NOT NULL,
                 payload_json TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS task_lists_by_user_clock ON task_lists (user_id, server_modified);
             CREATE INDEX IF NOT EXISTS task_lists_by_user_modified ON task_lists (user_id, last_modified);
             CREATE TABLE IF NOT EXISTS tasks (
                 id TEXT PRIMARY KEY,
                 user_id TEXT NOT NULL,
                 list_id TEXT NOT NULL,
                 parent_id TEXT CHECK (parent_id IS NULL OR parent_id <> id),
                 last_modified INTEGER NOT NULL,
                 hash TEXT NOT NULL,
                 is_deleted INTEGER NOT NULL,
                 server_modified INTEGER NOT NULL,
                 payload_json TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS tasks_by_user_clock ON tasks (user_id, server_modified);
             CREATE INDEX IF NOT EXISTS tasks_by_user_modified ON tasks (user_id, last_modified);
             CREATE INDEX IF NOT EXISTS tasks_by_parent ON tasks (parent_id);
             CREATE TABLE IF NOT EXISTS meta (
                 key TEXT PRIMARY KEY,
                 value INTEGER NOT NULL
             );",
        )
        .map_err(|err| sqlite_error("initialize schema", &self.db_path, err))?;

        Ok(())
    }

    /// Creates `user_id` if it does not exist yet and mints a new bearer
    /// token for it. Only the token's digest is stored, so the returned
    /// value is the one chance to see it.
    pub fn issue_token(&self, user_id: &str) -> T8dResult<String> {
        let user_id = user_id.trim();
        if user_id.is_empty() || user_id.len() > MAX_ID_LEN || user_id.contains(char::is_whitespace)
        {
            return Err(T8dError::usage(format!(
                "user id must be 1..={MAX_ID_LEN} bytes without whitespace"
            )));
        }

        let token = generate_token();
        let now = now_millis();

        let mut conn = self.connection()?;
        let transaction = conn
            .transaction()
            .map_err(|err| sqlite_error("start token transaction", &self.db_path, err))?;
        transaction
            .execute(
                "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
                params![user_id, now],
            )
            .map_err(|err| sqlite_error("create user", &self.db_path, err))?;
        transaction
            .execute(
                "INSERT INTO tokens (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![hash_token(&token), user_id, now],
            )
            .map_err(|err| sqlite_error("store token", &self.db_path, err))?;
        transaction
            .commit()
            .map_err(|err| sqlite_error("commit token transaction", &self.db_path, err))?;

        info!(user_id, "issued bearer token");
        Ok(token)
    }

    /// Maps a bearer token to its user, or `None` when it is unknown.
    pub fn authenticate(&self, token: &str) -> T8dResult<Option<String>> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }

        let conn = self.connection()?;
        conn.query_row(
            "SELECT user_id FROM tokens WHERE token_hash = ?1",
            [hash_token(token)],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|err| sqlite_error("look up token", &self.db_path, err))
    }

    /// Full snapshot of everything `user_id` owns, tombstones included.
    pub fn bootstrap(&self, user_id: &str) -> T8dResult<BootstrapResponse> {
        let mut conn = self.connection()?;
        let transaction = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| sqlite_error("start bootstrap transaction", &self.db_path, err))?;

        let timestamp = advance_clock(&transaction, &self.db_path)?;
        let lists = lists_for_user(&transaction, &self.db_path, user_id, None)?;
        let tasks = tasks_for_user(&transaction, &self.db_path, user_id, None)?;

        transaction
            .commit()
            .map_err(|err| sqlite_error("commit bootstrap transaction", &self.db_path, err))?;

        info!(
            user_id,
            lists = lists.len(),
            tasks = tasks.len(),
            "bootstrap snapshot served"
        );

        Ok(BootstrapResponse {
            timestamp,
            lists,
            tasks,
        })
    }
}

/// Issues the next server clock value: wall time, but always strictly above
/// the last value handed out. Must run inside a write transaction.
pub(crate) fn advance_clock(conn: &Connection, db_path: &Path) -> T8dResult<Millis> {
    let last = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", [CLOCK_KEY], |row| {
            row.get::<_, Millis>(0)
        })
        .optional()
        .map_err(|err| sqlite_error("read server clock", db_path, err))?;

    let now = now_millis();
    let next = match last {
        Some(last) => now.max(last + 1),
        None => now,
    };

    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![CLOCK_KEY, next],
    )
    .map_err(|err| sqlite_error("advance server clock", db_path, err))?;

    Ok(next)
}

/// Returns the owner and stored copy of a list.
pub(crate) fn load_list(
    conn: &Connection,
    db_path: &Path,
    id: &str,
) -> T8dResult<Option<(String, TaskList)>> {
    let row = conn
        .query_row(
            "SELECT user_id, payload_json FROM task_lists WHERE id = ?1",
            [id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .map_err(|err| sqlite_error("load list", db_path, err))?;

    match row {
        Some((owner, raw)) => Ok(Some((owner, decode_json("list", db_path, &raw)?))),
        None => Ok(None),
    }
}

pub(crate) fn load_task(
    conn: &Connection,
    db_path: &Path,
    id: &str,
) -> T8dResult<Option<(String, Task)>> {
    let row = conn
        .query_row(
            "SELECT user_id, payload_json FROM tasks WHERE id = ?1",
            [id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .map_err(|err| sqlite_error("load task", db_path, err))?;

    match row {
        Some((owner, raw)) => Ok(Some((owner, decode_json("task", db_path, &raw)?))),
        None => Ok(None),
    }
}

pub(crate) fn parent_of(
    conn: &Connection,
    db_path: &Path,
    user_id: &str,
    id: &str,
) -> T8dResult<Option<String>> {
    conn.query_row(
        "SELECT parent_id FROM tasks WHERE id = ?1 AND user_id = ?2",
        params![id, user_id],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map(Option::flatten)
    .map_err(|err| sqlite_error("walk parent chain", db_path, err))
}

pub(crate) fn upsert_list(
    conn: &Connection,
    user_id: &str,
    list: &TaskList,
    server_modified: Millis,
) -> Result<(), UpsertError> {
    let payload = serde_json::to_string(list)?;
    conn.execute(
        "INSERT INTO task_lists (id, user_id, last_modified, hash, is_deleted, server_modified, payload_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             last_modified = excluded.last_modified,
             hash = excluded.hash,
             is_deleted = excluded.is_deleted,
             server_modified = excluded.server_modified,
             payload_json = excluded.payload_json",
        params![
            list.id,
            user_id,
            list.last_modified,
            list.hash,
            list.is_deleted,
            server_modified,
            payload
        ],
    )?;
    Ok(())
}

pub(crate) fn upsert_task(
    conn: &Connection,
    user_id: &str,
    task: &Task,
    server_modified: Millis,
) -> Result<(), UpsertError> {
    let payload = serde_json::to_string(task)?;
    conn.execute(
        "INSERT INTO tasks (id, user_id, list_id, parent_id, last_modified, hash, is_deleted, server_modified, payload_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
             list_id = excluded.list_id,
             parent_id = excluded.parent_id,
             last_modified = excluded.last_modified,
             hash = excluded.hash,
             is_deleted = excluded.is_deleted,
             server_modified = excluded.server_modified,
             payload_json = excluded.payload_json",
        params![
            task.id,
            user_id,
            task.list_id,
            task.parent_id,
            task.last_modified,
            task.hash,
            task.is_deleted,
            server_modified,
            payload
        ],
    )?;
    Ok(())
}

#[derive(Debug)]
pub(crate) enum UpsertError {
    Sql(SqlError),
    Encode(serde_json::Error),
}

impl From<SqlError> for UpsertError {
    fn from(value: SqlError) -> Self {
        Self::Sql(value)
    }
}

impl From<serde_json::Error> for UpsertError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value)
    }
}

/// Lists owned by `user_id`, optionally only those changed after `since`
/// by either clock.
pub(crate) fn lists_for_user(
    conn: &Connection,
    db_path: &Path,
    user_id: &str,
    since: Option<Millis>,
) -> T8dResult<Vec<TaskList>> {
    query_payloads(
        conn,
        db_path,
        "list",
        "SELECT payload_json FROM task_lists
         WHERE user_id = ?1 AND (?2 IS NULL OR last_modified > ?2 OR server_modified > ?2)
         ORDER BY server_modified, id",
        user_id,
        since,
    )
}

pub(crate) fn tasks_for_user(
    conn: &Connection,
    db_path: &Path,
    user_id: &str,
    since: Option<Millis>,
) -> T8dResult<Vec<Task>> {
    query_payloads(
        conn,
        db_path,
        "task",
        "SELECT payload_json FROM tasks
         WHERE user_id = ?1 AND (?2 IS NULL OR last_modified > ?2 OR server_modified > ?2)
         ORDER BY server_modified, id",
        user_id,
        since,
    )
}

fn query_payloads<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    db_path: &Path,
    what: &str,
    sql: &str,
    user_id: &str,
    since: Option<Millis>,
) -> T8dResult<Vec<T>> {
    let mut statement = conn
        .prepare(sql)
        .map_err(|err| sqlite_error(&format!("prepare {what} query"), db_path, err))?;
    let rows = statement
        .query_map(params![user_id, since], |row| row.get::<_, String>(0))
        .map_err(|err| sqlite_error(&format!("query {what} rows"), db_path, err))?;

    let mut values = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| sqlite_error(&format!("read {what} row"), db_path, err))?;
        values.push(decode_json(what, db_path, &raw)?);
    }

    Ok(values)
}

pub(crate) fn sqlite_error(action: &str, db_path: &Path, err: SqlError) -> T8dError {
    if let SqlError::SqliteFailure(code, message) = &err
        && (code.code == ErrorCode::DatabaseCorrupt || code.code == ErrorCode::NotADatabase)
    {
        let detail = message.as_deref().unwrap_or("sqlite reported corruption");
        return T8dError::io(format!(
            "failed to {action}: server database '{}' is corrupted ({detail})",
            db_path.display()
        ));
    }

    T8dError::io(format!(
        "failed to {action} using server database '{}': {}",
        db_path.display(),
        err
    ))
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
