//! Change items and batches
//!
//! A broadcast item is the committed record's flat mapping plus
//! `_old` (prior state, for updates), `_deleted` (for deletes), and
//! `_scope_id` (copied from the record's `scope_id` field when
//! present). A batch carries the items of one producer POST.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::record::Record;

pub const OLD_MARKER: &str = "_old";
pub const DELETED_MARKER: &str = "_deleted";
pub const SCOPE_MARKER: &str = "_scope_id";

/// Record field that feeds `_scope_id`
pub const SCOPE_FIELD: &str = "scope_id";

/// One committed change, as the flat wire mapping.
pub fn write_item(stored: &Record, prior: Option<&Record>) -> Value {
    let mut item = stored.to_value();
    if let Some(obj) = item.as_object_mut() {
        if let Some(prior) = prior {
            obj.insert(OLD_MARKER.into(), prior.to_value());
        }
        if let Some(scope) = stored.get(SCOPE_FIELD) {
            if !scope.is_null() {
                obj.insert(SCOPE_MARKER.into(), scope.clone());
            }
        }
    }
    item
}

/// A delete notice: identity plus the `_deleted` marker.
pub fn delete_item(deleted: &Record) -> Value {
    let mut item = json!({
        "class_id": deleted.class_id,
        DELETED_MARKER: true,
    });
    if let Some(obj) = item.as_object_mut() {
        if let Some(id) = &deleted.id {
            obj.insert("id".into(), id.to_value());
        }
        if let Some(scope) = deleted.get(SCOPE_FIELD) {
            if !scope.is_null() {
                obj.insert(SCOPE_MARKER.into(), scope.clone());
            }
        }
    }
    item
}

/// Routing keys of an item.
pub fn item_class_id(item: &Value) -> Option<&str> {
    item.get("class_id").and_then(Value::as_str)
}

/// `"<class_id>/<id>"`, the object-subscription key.
pub fn item_object_key(item: &Value) -> Option<String> {
    let class_id = item_class_id(item)?;
    let id = item.get("id")?;
    let id = match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(format!("{}/{}", class_id, id))
}

pub fn item_scope(item: &Value) -> Option<&str> {
    item.get(SCOPE_MARKER).and_then(Value::as_str)
}

/// The producer POST body: `{type: "changes", items: [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    #[serde(rename = "type")]
    pub kind: String,
    pub items: Vec<Value>,
}

impl ChangeBatch {
    pub fn changes(items: Vec<Value>) -> Self {
        Self {
            kind: "changes".to_string(),
            items,
        }
    }
}
