//! The merge transaction behind `POST /sync`.
//!
//! Push and pull run in one `BEGIN IMMEDIATE` transaction, so concurrent
//! merges for the same database are serialized and the pull observes every
//! upsert of its own push. Each pushed row is applied under its own
//! savepoint: a row that breaks ownership or tree rules is rolled back and
//! reported while the rest of the batch commits.

use crate::store::{
    ServerStore, UpsertError, advance_clock, load_list, load_task, lists_for_user, parent_of,
    sqlite_error, tasks_for_user, upsert_list, upsert_task,
};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use t8d_api::{RejectedRow, SyncChanges, SyncResponse};
use t8d_core::time::Millis;
use t8d_core::{
    EntityKind, T8dError, T8dResult, Task, TaskList, incoming_wins, parents_first,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub response: SyncResponse,
    pub lists_applied: usize,
    pub tasks_applied: usize,
    /// Pushed rows that lost to the stored copy.
    pub stale: usize,
}

impl MergeOutcome {
    pub fn applied(&self) -> usize {
        self.lists_applied + self.tasks_applied
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RowOutcome {
    Applied,
    Stale,
    Rejected(String),
}

enum RowError {
    Constraint(String),
    Store(T8dError),
}

impl From<T8dError> for RowError {
    fn from(value: T8dError) -> Self {
        Self::Store(value)
    }
}

impl ServerStore {
    /// Upserts `changes` for `user_id` under last-writer-wins, then returns
    /// every row of that user changed after `last_sync`.
    pub fn merge(
        &self,
        user_id: &str,
        changes: &SyncChanges,
        last_sync: Option<Millis>,
    ) -> T8dResult<MergeOutcome> {
        let db_path = self.db_path().to_path_buf();
        let mut conn = self.connection()?;
        let mut transaction = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| sqlite_error("start merge transaction", &db_path, err))?;

        let timestamp = advance_clock(&transaction, &db_path)?;
        let mut tally = Tally::default();

        for list in &changes.task_lists {
            let outcome = isolated(&mut transaction, &db_path, |conn| {
                merge_list(conn, &db_path, user_id, list, timestamp)
            })?;
            tally.record(EntityKind::List, &list.id, outcome);
        }

        for task in parents_first(changes.tasks.clone()) {
            let outcome = isolated(&mut transaction, &db_path, |conn| {
                merge_task(conn, &db_path, user_id, &task, timestamp)
            })?;
            tally.record(EntityKind::Task, &task.id, outcome);
        }

        let since = last_sync.unwrap_or(0);
        let mut task_lists = lists_for_user(&transaction, &db_path, user_id, Some(since))?;
        let mut tasks = tasks_for_user(&transaction, &db_path, user_id, Some(since))?;
        include_rejected(
            &transaction,
            &db_path,
            user_id,
            &tally.rejected,
            &mut task_lists,
            &mut tasks,
        )?;

        transaction
            .commit()
            .map_err(|err| sqlite_error("commit merge transaction", &db_path, err))?;

        info!(
            user_id,
            pushed_lists = changes.task_lists.len(),
            pushed_tasks = changes.tasks.len(),
            applied_lists = tally.lists_applied,
            applied_tasks = tally.tasks_applied,
            stale = tally.stale,
            rejected = tally.rejected.len(),
            pulled_lists = task_lists.len(),
            pulled_tasks = tasks.len(),
            since,
            timestamp,
            "merge committed"
        );

        Ok(MergeOutcome {
            response: SyncResponse {
                timestamp,
                changes: SyncChanges { task_lists, tasks },
                rejected: tally.rejected,
            },
            lists_applied: tally.lists_applied,
            tasks_applied: tally.tasks_applied,
            stale: tally.stale,
        })
    }
}

#[derive(Default)]
struct Tally {
    lists_applied: usize,
    tasks_applied: usize,
    stale: usize,
    rejected: Vec<RejectedRow>,
}

impl Tally {
    fn record(&mut self, kind: EntityKind, id: &str, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Applied => match kind {
                EntityKind::List => self.lists_applied += 1,
                EntityKind::Task => self.tasks_applied += 1,
            },
            RowOutcome::Stale => {
                debug!(%kind, id, "pushed row is not newer than stored copy");
                self.stale += 1;
            }
            RowOutcome::Rejected(reason) => {
                warn!(%kind, id, %reason, "rejected pushed row");
                self.rejected.push(RejectedRow {
                    id: id.to_string(),
                    kind,
                    reason,
                });
            }
        }
    }
}

/// Runs one row's writes under a savepoint. Rejections and constraint
/// violations roll the savepoint back; any other storage failure aborts the
/// whole merge.
fn isolated<F>(transaction: &mut Transaction<'_>, db_path: &Path, apply: F) -> T8dResult<RowOutcome>
where
    F: FnOnce(&Connection) -> Result<RowOutcome, RowError>,
{
    let savepoint = transaction
        .savepoint()
        .map_err(|err| sqlite_error("open row savepoint", db_path, err))?;

    match apply(&savepoint) {
        Ok(RowOutcome::Rejected(reason)) => Ok(RowOutcome::Rejected(reason)),
        Ok(outcome) => {
            savepoint
                .commit()
                .map_err(|err| sqlite_error("release row savepoint", db_path, err))?;
            Ok(outcome)
        }
        Err(RowError::Constraint(detail)) => {
            Ok(RowOutcome::Rejected(format!("constraint violation: {detail}")))
        }
        Err(RowError::Store(error)) => Err(error),
    }
}

fn merge_list(
    conn: &Connection,
    db_path: &Path,
    user_id: &str,
    list: &TaskList,
    stamp: Millis,
) -> Result<RowOutcome, RowError> {
    let existing = match load_list(conn, db_path, &list.id)? {
        Some((owner, _)) if owner != user_id => return Ok(foreign_id()),
        Some((_, stored)) => Some(stored),
        None => None,
    };

    if !incoming_wins(list, existing.as_ref()) {
        return Ok(RowOutcome::Stale);
    }

    upsert_list(conn, user_id, list, stamp).map_err(|err| write_error("upsert list", db_path, err))?;
    Ok(RowOutcome::Applied)
}

fn merge_task(
    conn: &Connection,
    db_path: &Path,
    user_id: &str,
    task: &Task,
    stamp: Millis,
) -> Result<RowOutcome, RowError> {
    let existing = match load_task(conn, db_path, &task.id)? {
        Some((owner, _)) if owner != user_id => return Ok(foreign_id()),
        Some((_, stored)) => Some(stored),
        None => None,
    };

    if !incoming_wins(task, existing.as_ref()) {
        return Ok(RowOutcome::Stale);
    }

    match load_list(conn, db_path, &task.list_id)? {
        Some((owner, list)) if owner == user_id => {
            // Devices drop a deleted list's tasks, so a live task there
            // would be orphaned everywhere.
            if list.is_deleted && !task.is_deleted {
                return Ok(RowOutcome::Rejected(format!(
                    "list '{}' has been deleted",
                    task.list_id
                )));
            }
        }
        _ => {
            return Ok(RowOutcome::Rejected(format!(
                "list '{}' does not exist",
                task.list_id
            )));
        }
    }

    // A tombstone has no live position in the tree, so only live rows are
    // checked against their parent.
    if !task.is_deleted
        && let Some(parent_id) = task.parent_id.as_deref()
    {
        match load_task(conn, db_path, parent_id)? {
            Some((owner, parent)) if owner == user_id => {
                if parent.list_id != task.list_id {
                    return Ok(RowOutcome::Rejected(format!(
                        "parent task '{parent_id}' belongs to another list"
                    )));
                }
            }
            _ => {
                return Ok(RowOutcome::Rejected(format!(
                    "parent task '{parent_id}' does not exist"
                )));
            }
        }

        if chain_reaches(conn, db_path, user_id, parent_id, &task.id)? {
            return Ok(RowOutcome::Rejected(
                "parent chain would form a cycle".to_string(),
            ));
        }
    }

    upsert_task(conn, user_id, task, stamp).map_err(|err| write_error("upsert task", db_path, err))?;
    Ok(RowOutcome::Applied)
}

fn foreign_id() -> RowOutcome {
    RowOutcome::Rejected("id is not available".to_string())
}

/// Does walking up from `start` reach `target`? A pre-existing loop in the
/// stored chain counts as reaching it.
fn chain_reaches(
    conn: &Connection,
    db_path: &Path,
    user_id: &str,
    start: &str,
    target: &str,
) -> T8dResult<bool> {
    let mut seen = HashSet::new();
    let mut current = Some(start.to_string());

    while let Some(id) = current {
        if id == target || !seen.insert(id.clone()) {
            return Ok(true);
        }
        current = parent_of(conn, db_path, user_id, &id)?;
    }

    Ok(false)
}

fn write_error(action: &str, db_path: &Path, err: UpsertError) -> RowError {
    match err {
        UpsertError::Sql(rusqlite::Error::SqliteFailure(code, message))
            if code.code == ErrorCode::ConstraintViolation =>
        {
            RowError::Constraint(message.unwrap_or_else(|| "constraint failed".to_string()))
        }
        UpsertError::Sql(err) => RowError::Store(sqlite_error(action, db_path, err)),
        UpsertError::Encode(err) => {
            RowError::Store(T8dError::io(format!("failed to encode row for {action}: {err}")))
        }
    }
}

/// Adds the stored copy of every rejected row the user owns, so the device
/// converges on the server's version.
fn include_rejected(
    conn: &Connection,
    db_path: &Path,
    user_id: &str,
    rejected: &[RejectedRow],
    task_lists: &mut Vec<TaskList>,
    tasks: &mut Vec<Task>,
) -> T8dResult<()> {
    for row in rejected {
        match row.kind {
            EntityKind::List => {
                if task_lists.iter().any(|list| list.id == row.id) {
                    continue;
                }
                if let Some((owner, list)) = load_list(conn, db_path, &row.id)?
                    && owner == user_id
                {
                    task_lists.push(list);
                }
            }
            EntityKind::Task => {
                if tasks.iter().any(|task| task.id == row.id) {
                    continue;
                }
                if let Some((owner, task)) = load_task(conn, db_path, &row.id)?
                    && owner == user_id
                {
                    tasks.push(task);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use t8d_core::TaskStatus;

    fn store() -> (tempfile::TempDir, ServerStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ServerStore::open(&temp.path().join("server.db")).expect("open");
        (temp, store)
    }

    fn list(id: &str, last_modified: Millis, hash: &str) -> TaskList {
        TaskList {
            id: id.to_string(),
            name: format!("list {hash}"),
            description: None,
            order: 0.0,
            last_modified,
            hash: hash.to_string(),
            is_deleted: false,
        }
    }

    fn task(id: &str, list_id: &str, parent_id: Option<&str>) -> Task {
        Task {
            id: id.to_string(),
            name: format!("task {id}"),
            description: None,
            status: TaskStatus::NotCompleted,
            created_at: 100,
            last_modified: 100,
            due_date: None,
            list_id: list_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            order: 0.0,
            hash: format!("h-{id}"),
            is_deleted: false,
            metadata: None,
        }
    }

    fn push(
        store: &ServerStore,
        user: &str,
        lists: Vec<TaskList>,
        tasks: Vec<Task>,
        last_sync: Option<Millis>,
    ) -> MergeOutcome {
        store
            .merge(
                user,
                &SyncChanges {
                    task_lists: lists,
                    tasks,
                },
                last_sync,
            )
            .expect("merge")
    }

    #[test]
    fn later_timestamp_wins_in_either_arrival_order() {
        for order in [[100, 200], [200, 100]] {
            let (_temp, store) = store();
            for last_modified in order {
                push(&store, "u", vec![list("l1", last_modified, "x")], Vec::new(), None);
            }
            let snapshot = store.bootstrap("u").expect("bootstrap");
            assert_eq!(snapshot.lists[0].last_modified, 200);
        }
    }

    #[test]
    fn equal_timestamps_keep_greater_hash_in_either_order() {
        for order in [["a", "b"], ["b", "a"]] {
            let (_temp, store) = store();
            for hash in order {
                push(&store, "u", vec![list("l1", 100, hash)], Vec::new(), None);
            }
            let snapshot = store.bootstrap("u").expect("bootstrap");
            assert_eq!(snapshot.lists[0].hash, "b");
        }
    }

    #[test]
    fn replaying_a_push_applies_nothing_and_pulls_nothing_new() {
        let (_temp, store) = store();
        let first = push(&store, "u", vec![list("l1", 100, "a")], Vec::new(), None);
        assert_eq!(first.applied(), 1);

        let replay = push(
            &store,
            "u",
            vec![list("l1", 100, "a")],
            Vec::new(),
            Some(first.response.timestamp),
        );
        assert_eq!(replay.applied(), 0);
        assert_eq!(replay.stale, 1);
        assert!(replay.response.changes.is_empty());
        assert!(replay.response.timestamp > first.response.timestamp);
    }

    #[test]
    fn pull_returns_own_push_and_rows_newer_than_watermark() {
        let (_temp, store) = store();
        let outcome = push(
            &store,
            "u",
            vec![list("l1", 1000, "h1")],
            vec![task("t1", "l1", None)],
            None,
        );
        assert_eq!(outcome.response.changes.task_lists.len(), 1);
        assert_eq!(outcome.response.changes.tasks[0].id, "t1");
    }

    #[test]
    fn rows_written_with_old_device_clock_are_still_pulled() {
        let (_temp, store) = store();
        let watermark = push(&store, "u", Vec::new(), Vec::new(), None).response.timestamp;

        // Device clock far behind the server clock.
        push(&store, "u", vec![list("l1", 5, "a")], Vec::new(), None);

        let pull = push(&store, "u", Vec::new(), Vec::new(), Some(watermark));
        assert_eq!(pull.response.changes.task_lists.len(), 1);
    }

    #[test]
    fn children_before_parents_in_the_batch_still_apply() {
        let (_temp, store) = store();
        let outcome = push(
            &store,
            "u",
            vec![list("l1", 100, "a")],
            vec![
                task("grandchild", "l1", Some("child")),
                task("child", "l1", Some("root")),
                task("root", "l1", None),
            ],
            None,
        );
        assert_eq!(outcome.tasks_applied, 3);
        assert!(outcome.response.rejected.is_empty());
    }

    #[test]
    fn foreign_ids_are_rejected_without_touching_the_owner() {
        let (_temp, store) = store();
        push(&store, "alice", vec![list("l1", 100, "a")], Vec::new(), None);

        let outcome = push(&store, "mallory", vec![list("l1", 999, "z")], Vec::new(), None);
        assert_eq!(outcome.applied(), 0);
        assert_eq!(outcome.response.rejected.len(), 1);
        assert!(outcome.response.changes.is_empty());

        let alice = store.bootstrap("alice").expect("bootstrap");
        assert_eq!(alice.lists[0].hash, "a");
        assert!(store.bootstrap("mallory").expect("bootstrap").lists.is_empty());
    }

    #[test]
    fn tasks_in_foreign_or_missing_lists_are_rejected_individually() {
        let (_temp, store) = store();
        push(&store, "alice", vec![list("alice-list", 100, "a")], Vec::new(), None);

        let outcome = push(
            &store,
            "bob",
            vec![list("bob-list", 100, "b")],
            vec![
                task("ok", "bob-list", None),
                task("foreign", "alice-list", None),
                task("missing", "nowhere", None),
            ],
            None,
        );

        assert_eq!(outcome.tasks_applied, 1);
        let rejected: Vec<_> = outcome
            .response
            .rejected
            .iter()
            .map(|row| row.id.as_str())
            .collect();
        assert_eq!(rejected, vec!["foreign", "missing"]);
    }

    #[test]
    fn cycles_and_missing_parents_are_rejected() {
        let (_temp, store) = store();
        push(
            &store,
            "u",
            vec![list("l1", 100, "a")],
            vec![task("a", "l1", None), task("b", "l1", Some("a"))],
            None,
        );

        let mut cyclic = task("a", "l1", Some("b"));
        cyclic.last_modified = 200;
        let outcome = push(
            &store,
            "u",
            Vec::new(),
            vec![cyclic, task("orphan", "l1", Some("ghost"))],
            None,
        );

        assert_eq!(outcome.applied(), 0);
        assert_eq!(outcome.response.rejected.len(), 2);
        let stored_a = outcome
            .response
            .changes
            .tasks
            .iter()
            .find(|task| task.id == "a")
            .expect("server copy of rejected row");
        assert_eq!(stored_a.parent_id, None);
    }

    #[test]
    fn tombstones_are_kept_and_pulled() {
        let (_temp, store) = store();
        let first = push(&store, "u", vec![list("l1", 100, "a")], Vec::new(), None);

        let mut tombstone = list("l1", 200, "t");
        tombstone.is_deleted = true;
        push(&store, "u", vec![tombstone], Vec::new(), None);

        let pull = push(&store, "u", Vec::new(), Vec::new(), Some(first.response.timestamp));
        assert_eq!(pull.response.changes.task_lists.len(), 1);
        assert!(pull.response.changes.task_lists[0].is_deleted);
    }

    #[test]
    fn live_task_in_deleted_list_is_rejected_but_tombstone_is_kept() {
        let (_temp, store) = store();
        let mut deleted = list("l1", 200, "t");
        deleted.is_deleted = true;
        push(&store, "u", vec![deleted], Vec::new(), None);

        let mut gone = task("gone", "l1", None);
        gone.is_deleted = true;
        let outcome = push(
            &store,
            "u",
            Vec::new(),
            vec![task("late", "l1", None), gone],
            None,
        );

        assert_eq!(outcome.tasks_applied, 1);
        assert_eq!(outcome.response.rejected.len(), 1);
        assert_eq!(outcome.response.rejected[0].id, "late");
        assert!(outcome.response.rejected[0].reason.contains("has been deleted"));

        let snapshot = store.bootstrap("u").expect("bootstrap");
        assert!(snapshot.tasks.iter().all(|task| task.is_deleted));
        assert!(snapshot.tasks.iter().any(|task| task.id == "gone"));
    }
}
