//! Parent/child walks over an in-memory snapshot of tasks.
//!
//! Built once per operation from the tasks of one list (or of the whole
//! store); every walk keeps a visited set so a corrupted parent chain cannot
//! loop forever.

use crate::model::{Task, TaskStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct TaskTree {
    parents: HashMap<String, Option<String>>,
    statuses: HashMap<String, TaskStatus>,
    children: BTreeMap<Option<String>, Vec<String>>,
}

/// What deleting one task does to its subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletePlan {
    /// Ids to remove, the deleted task included.
    pub remove: Vec<String>,
    /// Surviving descendants and the parent they move to.
    pub reparent: Vec<(String, Option<String>)>,
}

impl TaskTree {
    pub fn from_tasks<'a, I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let mut tree = Self::default();
        for task in tasks {
            tree.parents.insert(task.id.clone(), task.parent_id.clone());
            tree.statuses.insert(task.id.clone(), task.status);
        }

        for (id, parent) in &tree.parents {
            // A parent we do not know about is treated as the root level.
            let key = match parent {
                Some(parent) if tree.parents.contains_key(parent) => Some(parent.clone()),
                _ => None,
            };
            tree.children.entry(key).or_default().push(id.clone());
        }

        for siblings in tree.children.values_mut() {
            siblings.sort();
        }

        tree
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parents.contains_key(id)
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.parents.get(id).and_then(|parent| parent.as_deref())
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.children
            .get(&Some(id.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All descendants of `id`, breadth first, `id` excluded.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::from([id.to_string()]);
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            for child in self.children_of(current) {
                if seen.insert(child.clone()) {
                    out.push(child.clone());
                    queue.push_back(child);
                }
            }
        }

        out
    }

    /// Ancestors of `id`, nearest first. Stops at the first repeated id.
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::from([id.to_string()]);
        let mut cursor = self.parent_of(id);

        while let Some(parent) = cursor {
            if !seen.insert(parent.to_string()) {
                break;
            }
            out.push(parent.to_string());
            cursor = self.parent_of(parent);
        }

        out
    }

    /// Would giving `id` the parent `new_parent` close a loop?
    pub fn would_create_cycle(&self, id: &str, new_parent: Option<&str>) -> bool {
        let Some(new_parent) = new_parent else {
            return false;
        };

        if new_parent == id {
            return true;
        }

        self.descendants(id).iter().any(|child| child == new_parent)
    }

    /// Descendants that completing `id` has to mark completed too.
    pub fn completion_cascade(&self, id: &str) -> Vec<String> {
        self.descendants(id)
            .into_iter()
            .filter(|child| {
                self.statuses
                    .get(child)
                    .is_some_and(|status| !status.is_completed())
            })
            .collect()
    }

    /// Completed children go away with their whole completed subtree;
    /// incomplete tasks found anywhere below survive and are promoted to the
    /// deleted task's parent.
    pub fn plan_delete(&self, id: &str) -> DeletePlan {
        let mut plan = DeletePlan {
            remove: vec![id.to_string()],
            reparent: Vec::new(),
        };

        let target_parent = self.parent_of(id).map(str::to_string);
        let mut seen = BTreeSet::from([id.to_string()]);
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            for child in self.children_of(current) {
                if !seen.insert(child.clone()) {
                    continue;
                }

                let completed = self
                    .statuses
                    .get(child)
                    .is_some_and(|status| status.is_completed());

                if completed {
                    plan.remove.push(child.clone());
                    queue.push_back(child);
                } else {
                    plan.reparent.push((child.clone(), target_parent.clone()));
                }
            }
        }

        plan
    }
}

/// Order tasks so that each one comes after its parent whenever the parent
/// is part of the same batch. Roots and tasks whose parent is outside the
/// batch come first, in their original relative order.
pub fn parents_first(tasks: Vec<Task>) -> Vec<Task> {
    let index_by_id: HashMap<String, usize> = tasks
        .iter()
        .enumerate()
        .map(|(index, task)| (task.id.clone(), index))
        .collect();

    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut queue = VecDeque::new();

    for (index, task) in tasks.iter().enumerate() {
        let parent_index = task
            .parent_id
            .as_ref()
            .and_then(|parent| index_by_id.get(parent))
            .copied()
            .filter(|parent_index| *parent_index != index);

        match parent_index {
            Some(parent_index) => children.entry(parent_index).or_default().push(index),
            None => queue.push_back(index),
        }
    }

    let mut ordered_indexes = Vec::with_capacity(tasks.len());
    let mut emitted = vec![false; tasks.len()];

    while let Some(index) = queue.pop_front() {
        if emitted[index] {
            continue;
        }
        emitted[index] = true;
        ordered_indexes.push(index);
        if let Some(kids) = children.get(&index) {
            queue.extend(kids.iter().copied());
        }
    }

    // Members of an in-batch cycle are never reached from a root; keep them
    // at the end so the store can reject them row by row.
    for (index, done) in emitted.iter().enumerate() {
        if !done {
            ordered_indexes.push(index);
        }
    }

    let mut slots: Vec<Option<Task>> = tasks.into_iter().map(Some).collect();
    ordered_indexes
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect()
}
