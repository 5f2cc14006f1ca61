use serde::{Deserialize, Serialize};
use t8d_core::time::{self, Millis};
use t8d_core::{EntityKind, Task, TaskList, ValidationIssue};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncChanges {
    #[serde(rename = "taskLists", default)]
    pub task_lists: Vec<TaskList>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl SyncChanges {
    pub fn is_empty(&self) -> bool {
        self.task_lists.is_empty() && self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.task_lists.len() + self.tasks.len()
    }
}

/// Body of `POST /sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub changes: SyncChanges,
    #[serde(
        rename = "lastSync",
        default,
        with = "time::iso_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_sync: Option<Millis>,
    #[serde(rename = "socketId", default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
}

/// A pushed row the server refused while the rest of the batch went through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub id: String,
    pub kind: EntityKind,
    pub reason: String,
}

/// Body of a successful `POST /sync` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(with = "time::iso")]
    pub timestamp: Millis,
    pub changes: SyncChanges,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedRow>,
}

/// Body of `GET /sync/bootstrap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    #[serde(with = "time::iso")]
    pub timestamp: Millis,
    pub lists: Vec<TaskList>,
    pub tasks: Vec<Task>,
}

/// Error body shared by every endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationIssue>,
}

/// Frames sent from the server on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeFrame {
    #[serde(rename = "session")]
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "SYNC_POKE")]
    Poke,
}
