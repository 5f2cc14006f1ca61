//! Boundary validation for pushed payloads.
//!
//! Every element is checked and every problem collected before anything is
//! handed to the merge, so a malformed batch is rejected as a whole with a
//! field-level report.

use crate::wire::{SyncChanges, SyncRequest};
use serde::de::DeserializeOwned;
use serde_json::Value;
use t8d_core::time::parse_iso;
use t8d_core::{T8dError, T8dResult, Task, TaskList, ValidationIssue};

pub const MAX_ID_LEN: usize = 128;
const INVALID_SYNC_DATA: &str = "Invalid sync data";

pub fn parse_sync_request(body: &[u8]) -> T8dResult<SyncRequest> {
    let value = serde_json::from_slice::<Value>(body).map_err(|err| {
        T8dError::validation(
            INVALID_SYNC_DATA,
            vec![ValidationIssue::new("", format!("body is not valid JSON: {err}"))],
        )
    })?;

    validate_sync_request(&value)
}

pub fn validate_sync_request(value: &Value) -> T8dResult<SyncRequest> {
    let mut issues = Vec::new();

    let Some(object) = value.as_object() else {
        return Err(T8dError::validation(
            INVALID_SYNC_DATA,
            vec![ValidationIssue::new("", "expected a JSON object")],
        ));
    };

    let mut changes = SyncChanges::default();
    match object.get("changes") {
        Some(Value::Object(raw_changes)) => {
            changes.task_lists = validate_array(
                raw_changes.get("taskLists"),
                "changes.taskLists",
                check_list,
                &mut issues,
            );
            changes.tasks = validate_array(
                raw_changes.get("tasks"),
                "changes.tasks",
                check_task,
                &mut issues,
            );
        }
        Some(_) => issues.push(ValidationIssue::new("changes", "expected an object")),
        None => issues.push(ValidationIssue::new("changes", "required")),
    }

    let last_sync = match object.get("lastSync") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => match parse_iso(raw) {
            Some(value) => Some(value),
            None => {
                issues.push(ValidationIssue::new(
                    "lastSync",
                    format!("invalid timestamp '{raw}'"),
                ));
                None
            }
        },
        Some(_) => {
            issues.push(ValidationIssue::new("lastSync", "expected a string"));
            None
        }
    };

    let socket_id = match object.get("socketId") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) if raw.trim().is_empty() => None,
        Some(Value::String(raw)) => Some(raw.clone()),
        Some(_) => {
            issues.push(ValidationIssue::new("socketId", "expected a string"));
            None
        }
    };

    if !issues.is_empty() {
        return Err(T8dError::validation(INVALID_SYNC_DATA, issues));
    }

    Ok(SyncRequest {
        changes,
        last_sync,
        socket_id,
    })
}

fn validate_array<T, F>(
    raw: Option<&Value>,
    path: &str,
    check: F,
    issues: &mut Vec<ValidationIssue>,
) -> Vec<T>
where
    T: DeserializeOwned,
    F: Fn(&T, &str, &mut Vec<ValidationIssue>),
{
    let items = match raw {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            issues.push(ValidationIssue::new(path, "expected an array"));
            return Vec::new();
        }
    };

    let mut parsed = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let item_path = format!("{path}[{index}]");
        match serde_json::from_value::<T>(item.clone()) {
            Ok(value) => {
                check(&value, &item_path, issues);
                parsed.push(value);
            }
            Err(err) => issues.push(ValidationIssue::new(item_path, err.to_string())),
        }
    }

    parsed
}

fn check_id(value: &str, path: String, issues: &mut Vec<ValidationIssue>) {
    if value.trim().is_empty() {
        issues.push(ValidationIssue::new(path, "must not be empty"));
    } else if value.len() > MAX_ID_LEN {
        issues.push(ValidationIssue::new(
            path,
            format!("must be at most {MAX_ID_LEN} bytes"),
        ));
    }
}

fn check_list(list: &TaskList, path: &str, issues: &mut Vec<ValidationIssue>) {
    check_id(&list.id, format!("{path}.id"), issues);
    if list.name.trim().is_empty() {
        issues.push(ValidationIssue::new(format!("{path}.name"), "must not be empty"));
    }
    if !list.order.is_finite() {
        issues.push(ValidationIssue::new(format!("{path}.order"), "must be finite"));
    }
}

fn check_task(task: &Task, path: &str, issues: &mut Vec<ValidationIssue>) {
    check_id(&task.id, format!("{path}.id"), issues);
    check_id(&task.list_id, format!("{path}.listId"), issues);
    if task.name.trim().is_empty() {
        issues.push(ValidationIssue::new(format!("{path}.name"), "must not be empty"));
    }
    if let Some(parent_id) = task.parent_id.as_deref() {
        check_id(parent_id, format!("{path}.parentId"), issues);
        if parent_id == task.id {
            issues.push(ValidationIssue::new(
                format!("{path}.parentId"),
                "a task cannot be its own parent",
            ));
        }
    }
    if !task.order.is_finite() {
        issues.push(ValidationIssue::new(format!("{path}.order"), "must be finite"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use t8d_core::ErrorKind;

    fn valid_task() -> Value {
        json!({
            "id": "t1",
            "name": "Buy milk",
            "status": "not_completed",
            "createdAt": "2024-01-01T00:00:00Z",
            "lastModified": 1000,
            "listId": "l1",
            "parentId": null,
            "hash": "h1"
        })
    }

    #[test]
    fn accepts_minimal_payload_and_defaults_arrays() {
        let request = validate_sync_request(&json!({"changes": {}})).expect("valid");
        assert!(request.changes.is_empty());
        assert!(request.last_sync.is_none());
        assert!(request.socket_id.is_none());
    }

    #[test]
    fn accepts_full_payload() {
        let request = validate_sync_request(&json!({
            "changes": {
                "taskLists": [{
                    "id": "l1",
                    "name": "Home",
                    "lastModified": "2024-01-01T00:00:00Z",
                    "hash": "a"
                }],
                "tasks": [valid_task()]
            },
            "lastSync": "2024-01-01T00:00:10Z",
            "socketId": "sock-1"
        }))
        .expect("valid");

        assert_eq!(request.changes.task_lists.len(), 1);
        assert_eq!(request.changes.tasks[0].last_modified, 1000);
        assert_eq!(request.last_sync, Some(1_704_067_210_000));
        assert_eq!(request.socket_id.as_deref(), Some("sock-1"));
    }

    #[test]
    fn collects_every_issue_with_paths() {
        let mut nameless = valid_task();
        nameless["name"] = json!("   ");
        let mut self_parent = valid_task();
        self_parent["parentId"] = json!("t1");
        let mut missing_status = valid_task();
        missing_status
            .as_object_mut()
            .expect("object")
            .remove("status");

        let error = validate_sync_request(&json!({
            "changes": {"tasks": [nameless, self_parent, missing_status]},
            "lastSync": "not a date"
        }))
        .expect_err("invalid");

        assert_eq!(error.kind, ErrorKind::Validation);
        let paths: Vec<&str> = error.issues.iter().map(|issue| issue.path.as_str()).collect();
        assert!(paths.contains(&"changes.tasks[0].name"));
        assert!(paths.contains(&"changes.tasks[1].parentId"));
        assert!(paths.contains(&"changes.tasks[2]"));
        assert!(paths.contains(&"lastSync"));
    }

    #[test]
    fn timestamps_past_the_calendar_reject_the_batch() {
        let mut far_task = valid_task();
        far_task["lastModified"] = json!(9_000_000_000_000_000i64);
        let mut far_due = valid_task();
        far_due["dueDate"] = json!(9e15);

        let error = validate_sync_request(&json!({
            "changes": {
                "taskLists": [{"id": "l1", "name": "Home", "lastModified": 9e15, "hash": "a"}],
                "tasks": [far_task, far_due]
            }
        }))
        .expect_err("invalid");

        let paths: Vec<&str> = error.issues.iter().map(|issue| issue.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["changes.taskLists[0]", "changes.tasks[0]", "changes.tasks[1]"]
        );
        assert!(error.issues[1].message.contains("out of range"));
    }

    #[test]
    fn rejects_missing_changes_and_non_json() {
        let error = validate_sync_request(&json!({"lastSync": null})).expect_err("invalid");
        assert_eq!(error.issues[0].path, "changes");

        let error = parse_sync_request(b"{not json").expect_err("invalid");
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(error.message, "Invalid sync data");
    }
}
