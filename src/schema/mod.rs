//! Schema model: reflective classes, inheritance, property resolution.

pub mod bootstrap;
pub mod registry;
pub mod types;

pub use bootstrap::{builtin_class, builtin_classes, system_class_ids};
pub use registry::{ClassMeta, SchemaRegistry};
pub use types::{
    is_system_class, ClassDef, DataType, OnOrphan, PropDef, ACTION, CLASS, CRUD_PROVIDER, EDITOR,
    EVENT, FUNCTION, PROP, PROVIDER, STORAGE,
};
