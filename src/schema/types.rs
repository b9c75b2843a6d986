//! Schema type definitions
//!
//! Classes and properties are ordinary records living in the reserved
//! `@class` and `@prop` classes. These types are the parsed view the
//! engine works with; the stored form stays plain JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{EngineError, EngineResult};
use crate::core::record::Record;

/// Reserved system class ids
pub const CLASS: &str = "@class";
pub const PROP: &str = "@prop";
pub const EDITOR: &str = "@editor";
pub const FUNCTION: &str = "@function";
pub const STORAGE: &str = "@storage";
pub const ACTION: &str = "@action";
pub const EVENT: &str = "@event";
pub const PROVIDER: &str = "@provider";
pub const CRUD_PROVIDER: &str = "crud_provider";

/// Whether an id names a reserved system class
pub fn is_system_class(class_id: &str) -> bool {
    class_id.starts_with('@') || class_id == CRUD_PROVIDER
}

/// Property data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Boolean,
    Integer,
    Float,
    Object,
    Relation,
    /// String whose value must be unique within the class
    Unique,
    /// Opaque code value, stored and transported but never executed here
    Function,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::String
    }
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Object => "object",
            DataType::Relation => "relation",
            DataType::Unique => "unique",
            DataType::Function => "function",
        }
    }
}

/// What happens to a referenced record when its last link is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnOrphan {
    #[default]
    Keep,
    Delete,
    Nullify,
}

/// Property definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropDef {
    /// `<class_id>.<key>` when persisted independently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Field key, unique within the class
    pub key: String,

    #[serde(default)]
    pub data_type: DataType,

    #[serde(default)]
    pub is_array: bool,

    /// Allowed target classes for relations and embedded objects
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_class_id: Vec<String>,

    /// Forbid subclasses of the target classes
    #[serde(default)]
    pub object_class_strict: bool,

    #[serde(default)]
    pub on_orphan: OnOrphan,

    /// Type-specific options, opaque to the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,

    /// Reference to an `@editor` record (UI hint)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,

    /// Inline rules and `@function` references, run in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Value>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub readonly: bool,

    #[serde(default)]
    pub create_only: bool,

    #[serde(default)]
    pub server_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_order: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,

    #[serde(default)]
    pub hidden: bool,
}

impl PropDef {
    pub fn new(key: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: None,
            key: key.into(),
            data_type,
            is_array: false,
            object_class_id: Vec::new(),
            object_class_strict: false,
            on_orphan: OnOrphan::Keep,
            options: None,
            editor: None,
            validators: Vec::new(),
            required: false,
            readonly: false,
            create_only: false,
            server_only: false,
            default_value: None,
            display_order: None,
            group_name: None,
            hidden: false,
        }
    }

    pub fn string(key: impl Into<String>) -> Self {
        Self::new(key, DataType::String)
    }

    pub fn boolean(key: impl Into<String>) -> Self {
        Self::new(key, DataType::Boolean)
    }

    pub fn integer(key: impl Into<String>) -> Self {
        Self::new(key, DataType::Integer)
    }

    pub fn relation(key: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::new(key, DataType::Relation);
        prop.object_class_id = vec![target.into()];
        prop
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn create_only(mut self) -> Self {
        self.create_only = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }

    pub fn targets(mut self, classes: Vec<String>) -> Self {
        self.object_class_id = classes;
        self
    }

    pub fn order(mut self, display_order: i64) -> Self {
        self.display_order = Some(display_order);
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Class definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub id: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Parent class id; write-once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends_id: Option<String>,

    /// Ordered property definitions
    #[serde(default)]
    pub props: Vec<PropDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,

    #[serde(default)]
    pub is_system: bool,

    #[serde(default)]
    pub is_abstract: bool,
}

impl ClassDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            extends_id: None,
            props: Vec::new(),
            table_name: None,
            is_system: false,
            is_abstract: false,
        }
    }

    pub fn with_props(mut self, props: Vec<PropDef>) -> Self {
        self.props = props;
        self
    }

    pub fn extending(mut self, parent: impl Into<String>) -> Self {
        self.extends_id = Some(parent.into());
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub fn prop(&self, key: &str) -> Option<&PropDef> {
        self.props.iter().find(|p| p.key == key)
    }

    /// Parse a class definition out of a stored `@class` record.
    pub fn from_record(record: &Record) -> EngineResult<ClassDef> {
        let mut value = record.to_value();
        normalize_props_value(&mut value);
        serde_json::from_value(value).map_err(|e| {
            EngineError::InvalidParams(format!("malformed class record: {}", e))
        })
    }

    /// Serialize back into the stored record shape.
    pub fn to_record(&self) -> Record {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("id");
        }
        let mut record = Record::from_value(value).unwrap_or_else(|_| Record::new(CLASS));
        record.id = Some(self.id.as_str().into());
        record.class_id = CLASS.to_string();
        record
    }
}

/// Accept `props` given as a mapping `{key: def}` by converting it to
/// the canonical ordered sequence, stamping each prop's id and key.
pub fn normalize_props_value(class_value: &mut Value) {
    let Some(obj) = class_value.as_object_mut() else {
        return;
    };
    let class_id = obj
        .get("id")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_default();

    let Some(props) = obj.get_mut("props") else {
        return;
    };

    if let Some(map) = props.as_object() {
        let mut sequence = Vec::with_capacity(map.len());
        for (key, def) in map {
            let mut entry = match def {
                Value::Object(inner) => inner.clone(),
                _ => Map::new(),
            };
            entry.insert("key".into(), Value::from(key.clone()));
            if !class_id.is_empty() {
                entry.insert("id".into(), Value::from(format!("{}.{}", class_id, key)));
            }
            sequence.push(Value::Object(entry));
        }
        *props = Value::Array(sequence);
    } else if let Some(items) = props.as_array_mut() {
        // stamp ids on sequence form too
        for item in items {
            if let Some(entry) = item.as_object_mut() {
                if !entry.contains_key("id") && !class_id.is_empty() {
                    if let Some(key) = entry.get("key").and_then(Value::as_str) {
                        let id = format!("{}.{}", class_id, key);
                        entry.insert("id".into(), Value::from(id));
                    }
                }
            }
        }
    }
}
