//! Record model
//!
//! Entities are uniformly shaped: a flat mapping from string keys to
//! JSON values, plus `id` and `class_id`. There is no source-level
//! inheritance; polymorphism lives entirely in the data.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const CREATED_BY: &str = "created_by";
pub const UPDATED_BY: &str = "updated_by";
pub const OWNER_ID: &str = "owner_id";
pub const APP_ID: &str = "app_id";
pub const DOMAIN: &str = "domain";

/// Record identifier: backend-allocated integer or caller-supplied string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Int(i64),
    Str(String),
}

impl Id {
    /// Parse an id out of a JSON value, if it holds one
    pub fn from_value(value: &Value) -> Option<Id> {
        match value {
            Value::Number(n) => n.as_i64().map(Id::Int),
            Value::String(s) => Some(Id::Str(s.clone())),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Id::Int(n) => Some(*n),
            Id::Str(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Id::Int(n) => Value::from(*n),
            Id::Str(s) => Value::from(s.clone()),
        }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Id::Int(n) => write!(f, "{}", n),
            Id::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Int(n)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::Str(s.to_string())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::Str(s)
    }
}

/// A stored entity: `{id, class_id, ...fields}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,

    #[serde(default)]
    pub class_id: String,

    /// Application fields, audit stamps, and any undeclared extras
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(class_id: impl Into<String>) -> Self {
        Self {
            id: None,
            class_id: class_id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<Id>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// The record's `name` field, used for uniqueness checks
    pub fn name(&self) -> Option<&str> {
        self.get("name").and_then(|v| v.as_str())
    }

    /// Whether the record belongs to a reserved system class
    pub fn is_system(&self) -> bool {
        self.class_id.starts_with('@')
    }

    pub fn id_string(&self) -> Option<String> {
        self.id.as_ref().map(|id| id.to_string())
    }

    /// Stamp creation time (backend-side, on first store)
    pub fn stamp_created(&mut self) {
        let now = now_rfc3339();
        self.fields.insert(CREATED_AT.into(), Value::from(now));
    }

    /// Stamp update time (backend-side, on every store)
    pub fn stamp_updated(&mut self) {
        let now = now_rfc3339();
        self.fields.insert(UPDATED_AT.into(), Value::from(now));
    }

    /// Serialize to a flat JSON object including id and class_id
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a record from a flat JSON object
    pub fn from_value(value: Value) -> Result<Record, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Current time as an RFC 3339 string, the audit-stamp format
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
