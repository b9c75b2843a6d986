//! Change detection
//!
//! Per-key diff between the merged record and its prior state. An
//! empty diff means the write is a no-op: no persist, no broadcast.

use serde_json::{Map, Value};

use crate::core::record::Record;

/// Marker key for freshly created records
pub const NEW_MARKER: &str = "_new";

/// Compute the per-key changes of `new` against `prior`.
///
/// Without a prior the whole write is one change, `{_new: true}`.
/// Audit stamps are the backend's to maintain and never count as
/// changes by themselves.
pub fn diff_records(new: &Record, prior: Option<&Record>) -> Map<String, Value> {
    let mut changes = Map::new();

    let Some(prior) = prior else {
        changes.insert(NEW_MARKER.into(), Value::Bool(true));
        return changes;
    };

    if new.id != prior.id {
        if let Some(id) = &new.id {
            changes.insert("id".into(), id.to_value());
        }
    }
    if new.class_id != prior.class_id {
        changes.insert("class_id".into(), Value::from(new.class_id.clone()));
    }

    for (key, value) in &new.fields {
        if is_audit_stamp(key) {
            continue;
        }
        if prior.get(key) != Some(value) {
            changes.insert(key.clone(), value.clone());
        }
    }

    // keys dropped from the merged record read as cleared
    for key in prior.fields.keys() {
        if is_audit_stamp(key) {
            continue;
        }
        if !new.contains(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }

    changes
}

fn is_audit_stamp(key: &str) -> bool {
    matches!(
        key,
        crate::core::record::CREATED_AT | crate::core::record::UPDATED_AT
    )
}
