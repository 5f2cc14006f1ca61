//! Local to-do operations.
//!
//! Every operation writes its rows and, while the device takes part in sync,
//! the matching outbox entries in one local transaction. Deleted rows are
//! removed physically; the outbox carries a tombstone so the deletion still
//! reaches the server.

use serde_json::{Map, Value};
use std::collections::HashMap;
use t8d_core::time::{Millis, next_modified, now_millis};
use t8d_core::{
    EntityKind, Fingerprint, T8dError, T8dResult, Task, TaskList, TaskStatus, TaskTree,
};
use t8d_store::{LocalBatch, LocalStore, OutboxRecord};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct NewList {
    pub name: String,
    pub description: Option<String>,
    pub order: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPatch {
    pub name: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub order: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub list_id: String,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<String>,
    pub due_date: Option<Millis>,
    pub order: Option<f64>,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub due_date: Option<Option<Millis>>,
    pub order: Option<f64>,
    pub metadata: Option<Option<Map<String, Value>>>,
}

impl TaskPatch {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.due_date.is_none()
            && self.order.is_none()
            && self.metadata.is_none()
    }
}

/// Rows touched by one operation, for reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskChanges {
    pub updated: Vec<Task>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TodoService {
    store: LocalStore,
}

impl TodoService {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn create_list(&self, input: NewList) -> T8dResult<TaskList> {
        let name = required_name(&input.name)?;
        let now = now_millis();

        let mut list = TaskList {
            id: Uuid::new_v4().to_string(),
            name,
            description: normalize_text(input.description),
            order: input.order.unwrap_or(now as f64),
            last_modified: now,
            hash: String::new(),
            is_deleted: false,
        };
        list.refresh_hash();

        let mut batch = LocalBatch {
            upsert_lists: vec![list.clone()],
            ..LocalBatch::default()
        };
        self.queue(&mut batch, OutboxRecord::upsert_list(&list))?;
        self.store.commit(&batch)?;

        debug!(list_id = %list.id, "created list");
        Ok(list)
    }

    pub fn update_list(&self, id: &str, patch: ListPatch) -> T8dResult<TaskList> {
        let mut list = self.require_list(id)?;

        if let Some(name) = patch.name {
            list.name = required_name(&name)?;
        }
        if let Some(description) = patch.description {
            list.description = normalize_text(description);
        }
        if let Some(order) = patch.order {
            list.order = finite_order(order)?;
        }
        touch_list(&mut list);

        let mut batch = LocalBatch {
            upsert_lists: vec![list.clone()],
            ..LocalBatch::default()
        };
        self.queue(&mut batch, OutboxRecord::upsert_list(&list))?;
        self.store.commit(&batch)?;

        Ok(list)
    }

    /// Removes the list and every task in it.
    pub fn delete_list(&self, id: &str) -> T8dResult<TaskChanges> {
        let list = self.require_list(id)?;
        let tasks = self.store.tasks_in_list(&list.id)?;

        let mut batch = LocalBatch {
            delete_lists: vec![list.id.clone()],
            delete_tasks: tasks.iter().map(|task| task.id.clone()).collect(),
            ..LocalBatch::default()
        };

        for task in &tasks {
            let mut tombstone = task.clone();
            tombstone.is_deleted = true;
            touch_task(&mut tombstone);
            self.queue(&mut batch, OutboxRecord::delete_task(&tombstone))?;
        }

        let mut tombstone = list.clone();
        tombstone.is_deleted = true;
        touch_list(&mut tombstone);
        self.queue(&mut batch, OutboxRecord::delete_list(&tombstone))?;

        self.store.commit(&batch)?;
        debug!(list_id = %list.id, tasks = tasks.len(), "deleted list");

        Ok(TaskChanges {
            updated: Vec::new(),
            removed: batch.delete_tasks,
        })
    }

    pub fn create_task(&self, input: NewTask) -> T8dResult<Task> {
        let name = required_name(&input.name)?;
        let list = self.require_list(&input.list_id)?;

        if let Some(parent_id) = input.parent_id.as_deref() {
            let parent = self.require_task(parent_id)?;
            if parent.list_id != list.id {
                return Err(T8dError::usage(format!(
                    "parent task '{}' belongs to another list",
                    parent.id
                )));
            }
        }

        let now = now_millis();
        let mut task = Task {
            id: Uuid::new_v4().to_string(),
            name,
            description: normalize_text(input.description),
            status: TaskStatus::NotCompleted,
            created_at: now,
            last_modified: now,
            due_date: input.due_date,
            list_id: list.id,
            parent_id: input.parent_id,
            order: match input.order {
                Some(order) => finite_order(order)?,
                None => now as f64,
            },
            hash: String::new(),
            is_deleted: false,
            metadata: input.metadata,
        };
        task.refresh_hash();

        let mut batch = LocalBatch {
            upsert_tasks: vec![task.clone()],
            ..LocalBatch::default()
        };
        self.queue(&mut batch, OutboxRecord::upsert_task(&task))?;
        self.store.commit(&batch)?;

        debug!(task_id = %task.id, "created task");
        Ok(task)
    }

    /// Applies a field patch. Completing a task completes its whole subtree.
    pub fn update_task(&self, id: &str, patch: TaskPatch) -> T8dResult<TaskChanges> {
        if patch.is_empty() {
            return Err(T8dError::usage("nothing to update"));
        }

        let mut task = self.require_task(id)?;
        let completes = patch.status == Some(TaskStatus::Completed);

        if let Some(name) = patch.name {
            task.name = required_name(&name)?;
        }
        if let Some(description) = patch.description {
            task.description = normalize_text(description);
        }
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(due_date) = patch.due_date {
            task.due_date = due_date;
        }
        if let Some(order) = patch.order {
            task.order = finite_order(order)?;
        }
        if let Some(metadata) = patch.metadata {
            task.metadata = metadata;
        }
        touch_task(&mut task);

        let mut updated = vec![task.clone()];
        if completes {
            updated.extend(self.cascade_completion(&task)?);
        }

        let mut batch = LocalBatch {
            upsert_tasks: updated.clone(),
            ..LocalBatch::default()
        };
        for changed in &updated {
            self.queue(&mut batch, OutboxRecord::upsert_task(changed))?;
        }
        self.store.commit(&batch)?;

        Ok(TaskChanges {
            updated,
            removed: Vec::new(),
        })
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) -> T8dResult<TaskChanges> {
        self.update_task(
            id,
            TaskPatch {
                status: Some(status),
                ..TaskPatch::default()
            },
        )
    }

    /// Re-parents a task within its list. `None` makes it a root task.
    pub fn move_task(&self, id: &str, new_parent: Option<&str>) -> T8dResult<Task> {
        let mut task = self.require_task(id)?;

        if let Some(parent_id) = new_parent {
            let parent = self.require_task(parent_id)?;
            if parent.list_id != task.list_id {
                return Err(T8dError::usage(format!(
                    "cannot move task '{}' under '{}': tasks belong to different lists",
                    task.id, parent.id
                )));
            }

            let siblings = self.store.tasks_in_list(&task.list_id)?;
            let tree = TaskTree::from_tasks(&siblings);
            if tree.would_create_cycle(&task.id, Some(&parent.id)) {
                return Err(T8dError::usage(format!(
                    "cannot move task '{}' under its own descendant '{}'",
                    task.id, parent.id
                )));
            }
        }

        task.parent_id = new_parent.map(str::to_string);
        touch_task(&mut task);

        let mut batch = LocalBatch {
            upsert_tasks: vec![task.clone()],
            ..LocalBatch::default()
        };
        self.queue(&mut batch, OutboxRecord::upsert_task(&task))?;
        self.store.commit(&batch)?;

        Ok(task)
    }

    /// Completed descendants go with the task; incomplete ones are promoted
    /// to the deleted task's parent.
    pub fn delete_task(&self, id: &str) -> T8dResult<TaskChanges> {
        let task = self.require_task(id)?;
        let siblings = self.store.tasks_in_list(&task.list_id)?;
        let by_id: HashMap<&str, &Task> = siblings
            .iter()
            .map(|sibling| (sibling.id.as_str(), sibling))
            .collect();

        let plan = TaskTree::from_tasks(&siblings).plan_delete(&task.id);
        let mut batch = LocalBatch {
            delete_tasks: plan.remove.clone(),
            ..LocalBatch::default()
        };

        for removed_id in &plan.remove {
            if let Some(removed) = by_id.get(removed_id.as_str()) {
                let mut tombstone = (*removed).clone();
                tombstone.is_deleted = true;
                touch_task(&mut tombstone);
                self.queue(&mut batch, OutboxRecord::delete_task(&tombstone))?;
            }
        }

        for (child_id, new_parent) in &plan.reparent {
            if let Some(child) = by_id.get(child_id.as_str()) {
                let mut promoted = (*child).clone();
                promoted.parent_id = new_parent.clone();
                touch_task(&mut promoted);
                self.queue(&mut batch, OutboxRecord::upsert_task(&promoted))?;
                batch.upsert_tasks.push(promoted);
            }
        }

        self.store.commit(&batch)?;
        debug!(
            task_id = %task.id,
            removed = plan.remove.len(),
            promoted = plan.reparent.len(),
            "deleted task"
        );

        Ok(TaskChanges {
            updated: batch.upsert_tasks,
            removed: plan.remove,
        })
    }

    pub fn lists(&self) -> T8dResult<Vec<TaskList>> {
        self.store.all_lists()
    }

    pub fn tasks(&self, list_id: Option<&str>) -> T8dResult<Vec<Task>> {
        match list_id {
            Some(list_id) => self.store.tasks_in_list(list_id),
            None => self.store.all_tasks(),
        }
    }

    pub fn resolve_list(&self, prefix: &str) -> T8dResult<String> {
        self.store.resolve_id(EntityKind::List, prefix)
    }

    pub fn resolve_task(&self, prefix: &str) -> T8dResult<String> {
        self.store.resolve_id(EntityKind::Task, prefix)
    }

    fn cascade_completion(&self, task: &Task) -> T8dResult<Vec<Task>> {
        let siblings = self.store.tasks_in_list(&task.list_id)?;
        let tree = TaskTree::from_tasks(&siblings);
        let pending: Vec<String> = tree.completion_cascade(&task.id);

        let mut completed = Vec::with_capacity(pending.len());
        for sibling in siblings {
            if pending.contains(&sibling.id) {
                let mut child = sibling;
                child.status = TaskStatus::Completed;
                touch_task(&mut child);
                completed.push(child);
            }
        }

        Ok(completed)
    }

    fn queue(&self, batch: &mut LocalBatch, record: OutboxRecord) -> T8dResult<()> {
        if self.store.records_outbox()? {
            batch.outbox.push(record);
        }
        Ok(())
    }

    fn require_list(&self, id: &str) -> T8dResult<TaskList> {
        self.store
            .get_list(id)?
            .ok_or_else(|| T8dError::not_found(format!("list '{id}' not found")))
    }

    fn require_task(&self, id: &str) -> T8dResult<Task> {
        self.store
            .get_task(id)?
            .ok_or_else(|| T8dError::not_found(format!("task '{id}' not found")))
    }
}

fn touch_list(list: &mut TaskList) {
    list.last_modified = next_modified(list.last_modified);
    list.refresh_hash();
}

fn touch_task(task: &mut Task) {
    task.last_modified = next_modified(task.last_modified);
    task.refresh_hash();
}

fn required_name(raw: &str) -> T8dResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(T8dError::usage("name cannot be empty"));
    }
    Ok(trimmed.to_string())
}

fn normalize_text(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn finite_order(order: f64) -> T8dResult<f64> {
    if !order.is_finite() {
        return Err(T8dError::usage("order must be a finite number"));
    }
    Ok(order)
}
