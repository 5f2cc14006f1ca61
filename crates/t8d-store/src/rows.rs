use crate::outbox::{OutboxRecord, clear_outbox, insert_outbox};
use crate::settings::{KEY_WATERMARK, write_setting};
use crate::{LocalStore, decode_json, encode_json, sqlite_error};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use t8d_core::time::Millis;
use t8d_core::{EntityKind, T8dError, T8dResult, Task, TaskList, TaskStatus, incoming_wins};
use tracing::debug;

/// Local writes that must land together with their outbox entries.
#[derive(Debug, Clone, Default)]
pub struct LocalBatch {
    pub upsert_lists: Vec<TaskList>,
    pub upsert_tasks: Vec<Task>,
    pub delete_lists: Vec<String>,
    pub delete_tasks: Vec<String>,
    pub outbox: Vec<OutboxRecord>,
}

/// What one successful round (or a bootstrap) hands back to the store.
#[derive(Debug, Clone, Default)]
pub struct RemoteApply<'a> {
    pub lists: &'a [TaskList],
    pub tasks: &'a [Task],
    /// Rows the server refused; its copy replaces ours without comparison.
    pub forced: HashSet<(EntityKind, String)>,
    /// Outbox entries up to this sequence were part of the request.
    pub clear_up_to: Option<i64>,
    pub watermark: Millis,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub lists_upserted: usize,
    pub lists_removed: usize,
    pub tasks_upserted: usize,
    pub tasks_removed: usize,
    /// Returned rows older than what this device already holds.
    pub skipped: usize,
    pub outbox_cleared: usize,
}

impl ApplySummary {
    pub fn changed(&self) -> usize {
        self.lists_upserted + self.lists_removed + self.tasks_upserted + self.tasks_removed
    }
}

impl LocalStore {
    pub fn commit(&self, batch: &LocalBatch) -> T8dResult<()> {
        let mut conn = self.connection()?;
        let transaction = conn
            .transaction()
            .map_err(|err| sqlite_error("start local transaction", &self.db_path, err))?;

        for list in &batch.upsert_lists {
            upsert_list(&transaction, &self.db_path, list)?;
        }
        for task in &batch.upsert_tasks {
            upsert_task(&transaction, &self.db_path, task)?;
        }
        for id in &batch.delete_tasks {
            delete_task(&transaction, &self.db_path, id)?;
        }
        for id in &batch.delete_lists {
            delete_list(&transaction, &self.db_path, id)?;
        }
        for record in &batch.outbox {
            insert_outbox(&transaction, &self.db_path, record)?;
        }

        transaction
            .commit()
            .map_err(|err| sqlite_error("commit local transaction", &self.db_path, err))
    }

    /// Applies server rows, clears the acknowledged outbox range and moves
    /// the watermark, all in one transaction.
    pub fn apply_remote(&self, remote: &RemoteApply<'_>) -> T8dResult<ApplySummary> {
        let mut conn = self.connection()?;
        let transaction = conn
            .transaction()
            .map_err(|err| sqlite_error("start apply transaction", &self.db_path, err))?;

        let mut summary = ApplySummary::default();

        for list in remote.lists {
            let forced = remote.forced.contains(&(EntityKind::List, list.id.clone()));
            let existing = load_list(&transaction, &self.db_path, &list.id)?;
            if !forced && !incoming_wins(list, existing.as_ref()) {
                summary.skipped += 1;
                continue;
            }

            if list.is_deleted {
                let removed_tasks = delete_tasks_in_list(&transaction, &self.db_path, &list.id)?;
                summary.tasks_removed += removed_tasks;
                if delete_list(&transaction, &self.db_path, &list.id)? {
                    summary.lists_removed += 1;
                }
            } else {
                upsert_list(&transaction, &self.db_path, list)?;
                summary.lists_upserted += 1;
            }
        }

        for task in remote.tasks {
            let forced = remote.forced.contains(&(EntityKind::Task, task.id.clone()));
            let existing = load_task(&transaction, &self.db_path, &task.id)?;
            if !forced && !incoming_wins(task, existing.as_ref()) {
                summary.skipped += 1;
                continue;
            }

            if task.is_deleted {
                if delete_task(&transaction, &self.db_path, &task.id)? {
                    summary.tasks_removed += 1;
                }
            } else {
                upsert_task(&transaction, &self.db_path, task)?;
                summary.tasks_upserted += 1;
            }
        }

        if let Some(up_to) = remote.clear_up_to {
            summary.outbox_cleared = clear_outbox(&transaction, &self.db_path, up_to)?;
        }

        write_setting(
            &transaction,
            &self.db_path,
            KEY_WATERMARK,
            &remote.watermark.to_string(),
        )?;

        transaction
            .commit()
            .map_err(|err| sqlite_error("commit apply transaction", &self.db_path, err))?;

        debug!(
            lists_upserted = summary.lists_upserted,
            lists_removed = summary.lists_removed,
            tasks_upserted = summary.tasks_upserted,
            tasks_removed = summary.tasks_removed,
            skipped = summary.skipped,
            watermark = remote.watermark,
            "applied server changes"
        );

        Ok(summary)
    }

    /// Queues every local row, so data written before sync was enabled
    /// reaches the server.
    pub fn enqueue_all(&self) -> T8dResult<usize> {
        let lists = self.all_lists()?;
        let tasks = self.all_tasks()?;

        let mut conn = self.connection()?;
        let transaction = conn
            .transaction()
            .map_err(|err| sqlite_error("start enqueue transaction", &self.db_path, err))?;

        for list in &lists {
            insert_outbox(&transaction, &self.db_path, &OutboxRecord::upsert_list(list))?;
        }
        for task in &tasks {
            insert_outbox(&transaction, &self.db_path, &OutboxRecord::upsert_task(task))?;
        }

        transaction
            .commit()
            .map_err(|err| sqlite_error("commit enqueue transaction", &self.db_path, err))?;

        Ok(lists.len() + tasks.len())
    }

    pub fn get_list(&self, id: &str) -> T8dResult<Option<TaskList>> {
        let conn = self.connection()?;
        load_list(&conn, &self.db_path, id)
    }

    pub fn get_task(&self, id: &str) -> T8dResult<Option<Task>> {
        let conn = self.connection()?;
        load_task(&conn, &self.db_path, id)
    }

    /// All lists in display order.
    pub fn all_lists(&self) -> T8dResult<Vec<TaskList>> {
        self.query_payloads(
            "list",
            "SELECT payload_json FROM task_lists ORDER BY sort_order ASC, id ASC",
            &[],
        )
    }

    pub fn all_tasks(&self) -> T8dResult<Vec<Task>> {
        self.query_payloads(
            "task",
            "SELECT payload_json FROM tasks ORDER BY list_id ASC, sort_order ASC, id ASC",
            &[],
        )
    }

    pub fn tasks_in_list(&self, list_id: &str) -> T8dResult<Vec<Task>> {
        self.query_payloads(
            "task",
            "SELECT payload_json FROM tasks WHERE list_id = ?1 ORDER BY sort_order ASC, id ASC",
            &[list_id],
        )
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> T8dResult<Vec<Task>> {
        self.query_payloads(
            "task",
            "SELECT payload_json FROM tasks WHERE status = ?1 ORDER BY sort_order ASC, id ASC",
            &[status.as_str()],
        )
    }

    /// Direct children of `parent_id`, or the root tasks when `None`.
    pub fn children_of(&self, parent_id: Option<&str>) -> T8dResult<Vec<Task>> {
        match parent_id {
            Some(parent_id) => self.query_payloads(
                "task",
                "SELECT payload_json FROM tasks WHERE parent_id = ?1 ORDER BY sort_order ASC, id ASC",
                &[parent_id],
            ),
            None => self.query_payloads(
                "task",
                "SELECT payload_json FROM tasks WHERE parent_id IS NULL ORDER BY sort_order ASC, id ASC",
                &[],
            ),
        }
    }

    /// Resolves a full id or a unique prefix of one.
    pub fn resolve_id(&self, kind: EntityKind, prefix: &str) -> T8dResult<String> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(T8dError::usage("id cannot be empty"));
        }

        let table = match kind {
            EntityKind::Task => "tasks",
            EntityKind::List => "task_lists",
        };
        let label = match kind {
            EntityKind::Task => "task",
            EntityKind::List => "list",
        };

        let conn = self.connection()?;
        let query = format!(
            "SELECT id FROM {table} WHERE id = ?1 OR substr(id, 1, length(?1)) = ?1 ORDER BY id LIMIT 3"
        );
        let mut statement = conn
            .prepare(&query)
            .map_err(|err| sqlite_error("prepare id lookup", &self.db_path, err))?;
        let matches = statement
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(|err| sqlite_error("look up id", &self.db_path, err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| sqlite_error("read id lookup row", &self.db_path, err))?;

        if matches.iter().any(|id| id == prefix) {
            return Ok(prefix.to_string());
        }

        match matches.as_slice() {
            [] => Err(T8dError::not_found(format!("no {label} matches '{prefix}'"))),
            [only] => Ok(only.clone()),
            _ => Err(T8dError::usage(format!(
                "'{prefix}' matches more than one {label}; use a longer prefix"
            ))),
        }
    }

    fn query_payloads<T: serde::de::DeserializeOwned>(
        &self,
        what: &str,
        sql: &str,
        args: &[&str],
    ) -> T8dResult<Vec<T>> {
        let conn = self.connection()?;
        let mut statement = conn
            .prepare(sql)
            .map_err(|err| sqlite_error(&format!("prepare {what} query"), &self.db_path, err))?;

        let rows = statement
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(|err| sqlite_error(&format!("query {what} rows"), &self.db_path, err))?;

        let mut out = Vec::new();
        for row in rows {
            let payload =
                row.map_err(|err| sqlite_error(&format!("read {what} row"), &self.db_path, err))?;
            out.push(decode_json(what, &self.db_path, &payload)?);
        }

        Ok(out)
    }
}

fn load_list(conn: &Connection, db_path: &Path, id: &str) -> T8dResult<Option<TaskList>> {
    let payload = conn
        .query_row(
            "SELECT payload_json FROM task_lists WHERE id = ?1",
            params![id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|err| sqlite_error("load list", db_path, err))?;

    payload
        .map(|raw| decode_json("list", db_path, &raw))
        .transpose()
}

fn load_task(conn: &Connection, db_path: &Path, id: &str) -> T8dResult<Option<Task>> {
    let payload = conn
        .query_row(
            "SELECT payload_json FROM tasks WHERE id = ?1",
            params![id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|err| sqlite_error("load task", db_path, err))?;

    payload
        .map(|raw| decode_json("task", db_path, &raw))
        .transpose()
}

fn upsert_list(conn: &Connection, db_path: &Path, list: &TaskList) -> T8dResult<()> {
    let payload = encode_json("list", list)?;
    conn.execute(
        "INSERT INTO task_lists (id, sort_order, last_modified, payload_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET sort_order = excluded.sort_order,
             last_modified = excluded.last_modified,
             payload_json = excluded.payload_json,
             updated_at = excluded.updated_at",
        params![
            list.id,
            list.order,
            list.last_modified,
            payload,
            Utc::now().to_rfc3339()
        ],
    )
    .map_err(|err| sqlite_error("save list", db_path, err))?;
    Ok(())
}

fn upsert_task(conn: &Connection, db_path: &Path, task: &Task) -> T8dResult<()> {
    let payload = encode_json("task", task)?;
    conn.execute(
        "INSERT INTO tasks (id, list_id, parent_id, status, sort_order, last_modified, payload_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET list_id = excluded.list_id,
             parent_id = excluded.parent_id,
             status = excluded.status,
             sort_order = excluded.sort_order,
             last_modified = excluded.last_modified,
             payload_json = excluded.payload_json,
             updated_at = excluded.updated_at",
        params![
            task.id,
            task.list_id,
            task.parent_id,
            task.status.as_str(),
            task.order,
            task.last_modified,
            payload,
            Utc::now().to_rfc3339()
        ],
    )
    .map_err(|err| sqlite_error("save task", db_path, err))?;
    Ok(())
}

fn delete_list(conn: &Connection, db_path: &Path, id: &str) -> T8dResult<bool> {
    let removed = conn
        .execute("DELETE FROM task_lists WHERE id = ?1", params![id])
        .map_err(|err| sqlite_error("delete list", db_path, err))?;
    Ok(removed > 0)
}

fn delete_task(conn: &Connection, db_path: &Path, id: &str) -> T8dResult<bool> {
    let removed = conn
        .execute("DELETE FROM tasks WHERE id = ?1", params![id])
        .map_err(|err| sqlite_error("delete task", db_path, err))?;
    Ok(removed > 0)
}

fn delete_tasks_in_list(conn: &Connection, db_path: &Path, list_id: &str) -> T8dResult<usize> {
    conn.execute("DELETE FROM tasks WHERE list_id = ?1", params![list_id])
        .map_err(|err| sqlite_error("delete tasks of list", db_path, err))
}
