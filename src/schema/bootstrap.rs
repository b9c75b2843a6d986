//! Compiled-in system class definitions
//!
//! `@class` is itself an instance of `@class`. Both it and the other
//! reserved classes are seeded from this table during a one-shot
//! bootstrap; before the bootstrap record exists, registry lookups for
//! system classes fall back to this table directly.

use serde_json::json;

use super::types::{
    ClassDef, DataType, PropDef, ACTION, CLASS, CRUD_PROVIDER, EDITOR, EVENT, FUNCTION, PROP,
    PROVIDER, STORAGE,
};

/// All reserved class ids, in seed order.
pub fn system_class_ids() -> &'static [&'static str] {
    &[
        CLASS,
        PROP,
        EDITOR,
        FUNCTION,
        STORAGE,
        ACTION,
        EVENT,
        PROVIDER,
        CRUD_PROVIDER,
    ]
}

/// Compiled-in definition for one system class, if the id names one.
pub fn builtin_class(class_id: &str) -> Option<ClassDef> {
    match class_id {
        CLASS => Some(class_class()),
        PROP => Some(prop_class()),
        EDITOR => Some(editor_class()),
        FUNCTION => Some(function_class()),
        STORAGE => Some(storage_class()),
        ACTION => Some(action_class()),
        EVENT => Some(event_class()),
        PROVIDER => Some(provider_class()),
        CRUD_PROVIDER => Some(crud_provider_class()),
        _ => None,
    }
}

/// The full seed set.
pub fn builtin_classes() -> Vec<ClassDef> {
    system_class_ids()
        .iter()
        .filter_map(|id| builtin_class(id))
        .collect()
}

fn class_class() -> ClassDef {
    ClassDef::new(CLASS, "Class")
        .system()
        .with_props(vec![
            PropDef::string("name").required().order(1),
            PropDef::string("description").order(2),
            PropDef::string("extends_id").create_only().order(3),
            PropDef::new("props", DataType::Object)
                .array()
                .targets(vec![PROP.into()])
                .order(4),
            PropDef::string("table_name").order(5),
            PropDef::boolean("is_system").readonly().order(6),
            PropDef::boolean("is_abstract")
                .with_default(json!(false))
                .order(7),
        ])
}

fn prop_class() -> ClassDef {
    ClassDef::new(PROP, "Property")
        .system()
        .with_props(vec![
            PropDef::string("key").required().order(1),
            PropDef::string("data_type")
                .required()
                .with_default(json!("string"))
                .order(2),
            PropDef::boolean("is_array").order(3),
            PropDef::string("object_class_id").array().order(4),
            PropDef::boolean("object_class_strict").order(5),
            PropDef::string("on_orphan").with_default(json!("keep")).order(6),
            PropDef::new("options", DataType::Object).order(7),
            PropDef::relation("editor", EDITOR).order(8),
            PropDef::new("validators", DataType::Object).array().order(9),
            PropDef::boolean("required").order(10),
            PropDef::boolean("readonly").order(11),
            PropDef::boolean("create_only").order(12),
            PropDef::boolean("server_only").order(13),
            PropDef::new("default_value", DataType::Object).order(14),
            PropDef::integer("display_order").order(15),
            PropDef::string("group_name").order(16),
            PropDef::boolean("hidden").order(17),
        ])
}

fn editor_class() -> ClassDef {
    ClassDef::new(EDITOR, "Editor").system().with_props(vec![
        PropDef::string("name").required().order(1),
        PropDef::string("description").order(2),
        PropDef::new("code", DataType::Function).order(3),
        PropDef::new("options", DataType::Object).order(4),
    ])
}

fn function_class() -> ClassDef {
    ClassDef::new(FUNCTION, "Function").system().with_props(vec![
        PropDef::string("name").required().order(1),
        PropDef::string("description").order(2),
        PropDef::new("code", DataType::Function).order(3),
        PropDef::new("params", DataType::Object).order(4),
    ])
}

fn storage_class() -> ClassDef {
    ClassDef::new(STORAGE, "Storage").system().with_props(vec![
        PropDef::string("type").required().order(1),
        PropDef::string("path").order(2),
        PropDef::string("uri").order(3),
        PropDef::string("database").order(4),
        PropDef::string("base_url").order(5),
        PropDef::new("options", DataType::Object).order(6),
    ])
}

fn action_class() -> ClassDef {
    ClassDef::new(ACTION, "Action").system().with_props(vec![
        PropDef::string("name").required().order(1),
        PropDef::string("description").order(2),
        PropDef::string("class_id").order(3),
        PropDef::relation("function_id", FUNCTION).order(4),
        PropDef::new("options", DataType::Object).order(5),
    ])
}

fn event_class() -> ClassDef {
    ClassDef::new(EVENT, "Event").system().with_props(vec![
        PropDef::string("name").required().order(1),
        PropDef::string("description").order(2),
        PropDef::string("class_id").order(3),
        PropDef::string("event_type").order(4),
        PropDef::relation("action_id", ACTION).order(5),
    ])
}

fn provider_class() -> ClassDef {
    ClassDef::new(PROVIDER, "Provider").system().with_props(vec![
        PropDef::string("name").required().order(1),
        PropDef::string("description").order(2),
        PropDef::new("options", DataType::Object).order(3),
    ])
}

fn crud_provider_class() -> ClassDef {
    ClassDef::new(CRUD_PROVIDER, "CRUD Provider")
        .system()
        .with_props(vec![
            PropDef::string("name").required().order(1),
            PropDef::string("description").order(2),
            PropDef::string("class_id").order(3),
            PropDef::new("options", DataType::Object).order(4),
        ])
}
