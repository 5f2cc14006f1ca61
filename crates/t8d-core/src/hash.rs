//! Content fingerprints used to break exact-timestamp ties.

use crate::model::{Task, TaskList};
use serde_json::Value;
use sha2::{Digest, Sha256};

const FIELD_SEPARATOR: u8 = 0x1f;

pub trait Fingerprint {
    /// SHA-256 hex digest of every mutable field except the stored hash.
    fn fingerprint(&self) -> String;

    fn refresh_hash(&mut self);
}

impl Fingerprint for Task {
    fn fingerprint(&self) -> String {
        let metadata = self
            .metadata
            .as_ref()
            .map(|map| canonical_json(&Value::Object(map.clone())))
            .unwrap_or_default();

        digest_fields(&[
            self.id.as_str(),
            self.name.as_str(),
            self.description.as_deref().unwrap_or_default(),
            self.status.as_str(),
            &self.created_at.to_string(),
            &self.last_modified.to_string(),
            &self.due_date.map(|due| due.to_string()).unwrap_or_default(),
            self.parent_id.as_deref().unwrap_or_default(),
            self.list_id.as_str(),
            &self.order.to_string(),
            bool_field(self.is_deleted),
            &metadata,
        ])
    }

    fn refresh_hash(&mut self) {
        self.hash = self.fingerprint();
    }
}

impl Fingerprint for TaskList {
    fn fingerprint(&self) -> String {
        digest_fields(&[
            self.id.as_str(),
            self.name.as_str(),
            self.description.as_deref().unwrap_or_default(),
            &self.last_modified.to_string(),
            &self.order.to_string(),
            bool_field(self.is_deleted),
        ])
    }

    fn refresh_hash(&mut self) {
        self.hash = self.fingerprint();
    }
}

fn bool_field(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn digest_fields(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// JSON text with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|key| {
                    let rendered_key =
                        serde_json::to_string(key).unwrap_or_else(|_| format!("\"{key}\""));
                    format!("{rendered_key}:{}", canonical_json(&map[key]))
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;
    use serde_json::{Map, json};

    fn task() -> Task {
        Task {
            id: "t1".to_string(),
            name: "Buy milk".to_string(),
            description: Some("2 litres".to_string()),
            status: TaskStatus::NotCompleted,
            created_at: 1000,
            last_modified: 1000,
            due_date: None,
            list_id: "l1".to_string(),
            parent_id: None,
            order: 1.0,
            hash: String::new(),
            is_deleted: false,
            metadata: None,
        }
    }

    #[test]
    fn identical_fields_produce_identical_hashes() {
        let mut left = task();
        let mut right = task();
        right.hash = "stale".to_string();
        left.refresh_hash();
        right.refresh_hash();
        assert_eq!(left.hash, right.hash);
        assert_eq!(left.hash.len(), 64);
    }

    #[test]
    fn any_mutable_field_changes_the_hash() {
        let base = task().fingerprint();

        let mut renamed = task();
        renamed.name = "Buy oat milk".to_string();
        assert_ne!(renamed.fingerprint(), base);

        let mut completed = task();
        completed.status = TaskStatus::Completed;
        assert_ne!(completed.fingerprint(), base);

        let mut moved = task();
        moved.parent_id = Some("t0".to_string());
        assert_ne!(moved.fingerprint(), base);

        let mut reordered = task();
        reordered.order = 2.0;
        assert_ne!(reordered.fingerprint(), base);

        let mut tombstoned = task();
        tombstoned.is_deleted = true;
        assert_ne!(tombstoned.fingerprint(), base);
    }

    #[test]
    fn field_boundaries_are_not_ambiguous() {
        let mut left = task();
        left.name = "ab".to_string();
        left.description = Some("c".to_string());

        let mut right = task();
        right.name = "a".to_string();
        right.description = Some("bc".to_string());

        assert_ne!(left.fingerprint(), right.fingerprint());
    }

    #[test]
    fn metadata_hash_ignores_key_insertion_order() {
        let mut first = Map::new();
        first.insert("b".to_string(), json!(1));
        first.insert("a".to_string(), json!({"y": true, "x": null}));

        let mut second = Map::new();
        second.insert("a".to_string(), json!({"x": null, "y": true}));
        second.insert("b".to_string(), json!(1));

        let mut left = task();
        left.metadata = Some(first);
        let mut right = task();
        right.metadata = Some(second);

        assert_eq!(left.fingerprint(), right.fingerprint());
        assert_eq!(
            canonical_json(&json!({"b": [2, {"d": 1, "c": 0}], "a": "x"})),
            r#"{"a":"x","b":[2,{"c":0,"d":1}]}"#
        );
    }

    #[test]
    fn list_hash_covers_name_and_tombstone() {
        let list = TaskList {
            id: "l1".to_string(),
            name: "Home".to_string(),
            description: None,
            order: 0.0,
            last_modified: 5,
            hash: String::new(),
            is_deleted: false,
        };
        let mut deleted = list.clone();
        deleted.is_deleted = true;
        assert_ne!(list.fingerprint(), deleted.fingerprint());
    }
}
