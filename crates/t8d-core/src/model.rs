use crate::time::{self, Millis};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "not_completed", alias = "not-completed")]
    NotCompleted,
    #[serde(rename = "completed")]
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotCompleted => "not_completed",
            Self::Completed => "completed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "not_completed" | "not-completed" => Some(Self::NotCompleted),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two replicated record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityKind {
    Task,
    List,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "TASK",
            Self::List => "LIST",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "TASK" => Some(Self::Task),
            "LIST" => Some(Self::List),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub order: f64,
    #[serde(with = "time::iso")]
    pub last_modified: Millis,
    pub hash: String,
    #[serde(rename = "is_deleted", default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    #[serde(with = "time::iso")]
    pub created_at: Millis,
    #[serde(with = "time::iso")]
    pub last_modified: Millis,
    #[serde(default, with = "time::iso_opt")]
    pub due_date: Option<Millis>,
    pub list_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order: f64,
    pub hash: String,
    #[serde(rename = "is_deleted", default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Task {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }
}

/// Fields every replicated record exposes to the conflict rule.
pub trait Versioned {
    fn id(&self) -> &str;
    fn last_modified(&self) -> Millis;
    fn content_hash(&self) -> &str;
    fn is_deleted(&self) -> bool;
    fn kind(&self) -> EntityKind;
}

impl Versioned for TaskList {
    fn id(&self) -> &str {
        &self.id
    }

    fn last_modified(&self) -> Millis {
        self.last_modified
    }

    fn content_hash(&self) -> &str {
        &self.hash
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn kind(&self) -> EntityKind {
        EntityKind::List
    }
}

impl Versioned for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn last_modified(&self) -> Millis {
        self.last_modified
    }

    fn content_hash(&self) -> &str {
        &self.hash
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Task
    }
}

/// Last-writer-wins: should `incoming` replace `existing`?
///
/// Greater `last_modified` wins. On an exact timestamp tie the greater hash
/// wins, compared byte-wise so the result does not depend on locale.
pub fn incoming_wins<T: Versioned + ?Sized, U: Versioned + ?Sized>(
    incoming: &T,
    existing: Option<&U>,
) -> bool {
    let Some(existing) = existing else {
        return true;
    };

    if incoming.last_modified() != existing.last_modified() {
        return incoming.last_modified() > existing.last_modified();
    }

    incoming.content_hash().as_bytes() > existing.content_hash().as_bytes()
}
