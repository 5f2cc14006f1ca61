use crate::{LocalStore, decode_json, encode_json, sqlite_error};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use t8d_core::time::{Millis, now_millis};
use t8d_core::{EntityKind, T8dError, T8dResult, Task, TaskList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxOperation {
    /// Create or replace.
    Update,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    fn parse(input: &str) -> Option<Self> {
        match input {
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Snapshot of the entity at the time the entry was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboxPayload {
    Task(Task),
    List(TaskList),
}

/// An entry about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub kind: EntityKind,
    pub operation: OutboxOperation,
    pub target_id: String,
    pub payload: Option<OutboxPayload>,
}

impl OutboxRecord {
    pub fn upsert_task(task: &Task) -> Self {
        Self {
            kind: EntityKind::Task,
            operation: OutboxOperation::Update,
            target_id: task.id.clone(),
            payload: Some(OutboxPayload::Task(task.clone())),
        }
    }

    pub fn upsert_list(list: &TaskList) -> Self {
        Self {
            kind: EntityKind::List,
            operation: OutboxOperation::Update,
            target_id: list.id.clone(),
            payload: Some(OutboxPayload::List(list.clone())),
        }
    }

    /// `tombstone` must already carry `is_deleted = true`.
    pub fn delete_task(tombstone: &Task) -> Self {
        Self {
            operation: OutboxOperation::Delete,
            ..Self::upsert_task(tombstone)
        }
    }

    pub fn delete_list(tombstone: &TaskList) -> Self {
        Self {
            operation: OutboxOperation::Delete,
            ..Self::upsert_list(tombstone)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub seq: i64,
    pub created_at: Millis,
    pub kind: EntityKind,
    pub operation: OutboxOperation,
    pub target_id: String,
    pub payload: Option<OutboxPayload>,
}

/// Pending entries collapsed to the newest one per entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingBatch {
    /// Ascending by sequence.
    pub entries: Vec<OutboxEntry>,
    /// Highest sequence read, including collapsed entries.
    pub max_seq: Option<i64>,
    pub raw_count: usize,
}

impl PendingBatch {
    pub fn lists(&self) -> Vec<TaskList> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.payload {
                Some(OutboxPayload::List(list)) => Some(list.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.payload {
                Some(OutboxPayload::Task(task)) => Some(task.clone()),
                _ => None,
            })
            .collect()
    }
}

impl LocalStore {
    pub fn record(&self, record: &OutboxRecord) -> T8dResult<i64> {
        let conn = self.connection()?;
        insert_outbox(&conn, &self.db_path, record)
    }

    pub fn collect_pending(&self) -> T8dResult<PendingBatch> {
        let conn = self.connection()?;
        let mut statement = conn
            .prepare(
                "SELECT seq, created_at, kind, operation, target_id, payload_json
                 FROM outbox ORDER BY seq ASC",
            )
            .map_err(|err| sqlite_error("prepare outbox query", &self.db_path, err))?;

        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(|err| sqlite_error("query outbox", &self.db_path, err))?;

        let mut raw = Vec::new();
        for row in rows {
            let (seq, created_at, kind, operation, target_id, payload) =
                row.map_err(|err| sqlite_error("read outbox row", &self.db_path, err))?;
            raw.push(OutboxEntry {
                seq,
                created_at,
                kind: EntityKind::parse(&kind).ok_or_else(|| {
                    T8dError::io(format!("unknown outbox entity kind '{kind}' at seq {seq}"))
                })?,
                operation: OutboxOperation::parse(&operation).ok_or_else(|| {
                    T8dError::io(format!("unknown outbox operation '{operation}' at seq {seq}"))
                })?,
                target_id,
                payload: payload
                    .map(|raw| decode_payload(&self.db_path, &kind, &raw))
                    .transpose()?,
            });
        }

        Ok(collapse(raw))
    }

    /// Removes every entry with `seq <= up_to`. Returns how many went.
    pub fn clear_up_to(&self, up_to: i64) -> T8dResult<usize> {
        let conn = self.connection()?;
        clear_outbox(&conn, &self.db_path, up_to)
    }

    pub fn pending_count(&self) -> T8dResult<usize> {
        let conn = self.connection()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
            .map_err(|err| sqlite_error("count outbox entries", &self.db_path, err))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

pub(crate) fn insert_outbox(
    conn: &Connection,
    db_path: &Path,
    record: &OutboxRecord,
) -> T8dResult<i64> {
    let payload = record
        .payload
        .as_ref()
        .map(|payload| encode_json("outbox payload", payload))
        .transpose()?;

    conn.execute(
        "INSERT INTO outbox (created_at, kind, operation, target_id, payload_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            now_millis(),
            record.kind.as_str(),
            record.operation.as_str(),
            record.target_id,
            payload
        ],
    )
    .map_err(|err| sqlite_error("append outbox entry", db_path, err))?;

    Ok(conn.last_insert_rowid())
}

pub(crate) fn clear_outbox(conn: &Connection, db_path: &Path, up_to: i64) -> T8dResult<usize> {
    conn.execute("DELETE FROM outbox WHERE seq <= ?1", params![up_to])
        .map_err(|err| sqlite_error("clear outbox", db_path, err))
}

fn decode_payload(db_path: &Path, kind: &str, raw: &str) -> T8dResult<OutboxPayload> {
    // Untagged decoding would accept a task as a list; go by the stored kind.
    match EntityKind::parse(kind) {
        Some(EntityKind::Task) => decode_json("outbox task", db_path, raw).map(OutboxPayload::Task),
        Some(EntityKind::List) => decode_json("outbox list", db_path, raw).map(OutboxPayload::List),
        None => Err(T8dError::io(format!("unknown outbox entity kind '{kind}'"))),
    }
}

fn collapse(raw: Vec<OutboxEntry>) -> PendingBatch {
    let raw_count = raw.len();
    let max_seq = raw.iter().map(|entry| entry.seq).max();

    let mut newest: HashMap<(EntityKind, String), OutboxEntry> = HashMap::new();
    for entry in raw {
        let key = (entry.kind, entry.target_id.clone());
        match newest.get(&key) {
            Some(current) if current.seq >= entry.seq => {}
            _ => {
                newest.insert(key, entry);
            }
        }
    }

    let mut entries: Vec<OutboxEntry> = newest.into_values().collect();
    entries.sort_by_key(|entry| entry.seq);

    PendingBatch {
        entries,
        max_seq,
        raw_count,
    }
}
