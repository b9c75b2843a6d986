//! Validate-and-build
//!
//! Single entry point for the write pipeline: casts input to the
//! declared types, applies defaults, validates per property, deep-
//! merges updates over the prior record, and recurses into embedded
//! objects and arrays. Errors are collected, never thrown; the caller
//! decides when a non-empty list becomes a failure.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::core::error::{EngineError, EngineResult, ValidationIssue};
use crate::core::record::{
    Id, Record, APP_ID, CREATED_AT, CREATED_BY, DOMAIN, OWNER_ID, UPDATED_AT, UPDATED_BY,
};
use crate::schema::{DataType, PropDef, SchemaRegistry};
use crate::storage::query::field_value;

use super::cast::{cast_value, type_name};
use super::rules::{is_function_rule, rule_name, run_rule};

/// Fields the engine controls; caller input never writes them directly.
const ENGINE_FIELDS: &[&str] = &[
    CREATED_AT, UPDATED_AT, CREATED_BY, UPDATED_BY, OWNER_ID, APP_ID, DOMAIN,
];

pub struct ObjectBuilder {
    registry: Arc<SchemaRegistry>,
}

impl ObjectBuilder {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Cast, default, validate, and merge `input` over `prior`.
    ///
    /// Returns the merged record and every issue found. Boxed because
    /// embedded objects recurse.
    pub fn validate_and_build<'a>(
        &'a self,
        class_id: &'a str,
        input: &'a Record,
        prior: Option<&'a Record>,
    ) -> BoxFuture<'a, EngineResult<(Record, Vec<ValidationIssue>)>> {
        Box::pin(async move {
            let Some(props) = self.registry.get_class_props(class_id).await? else {
                return Err(EngineError::InvalidParams(format!(
                    "class '{}' does not exist",
                    class_id
                )));
            };

            let mut issues = Vec::new();
            let mut result = match prior {
                Some(prior) => prior.clone(),
                None => Record::new(class_id),
            };
            result.class_id = class_id.to_string();

            // a record never conflicts with itself: exclude the input
            // id and the prior id (they differ during a class rename)
            let own_ids: Vec<Id> = input
                .id
                .iter()
                .chain(prior.and_then(|p| p.id.as_ref()))
                .cloned()
                .collect();

            for prop in &props {
                self.build_prop(class_id, prop, input, prior, &mut result, &mut issues)
                    .await?;

                // unique constraint needs the backend, not just the value
                if self.prop_is_unique(prop) {
                    if let Some(value) = result.get(&prop.key) {
                        if !value.is_null()
                            && self
                                .field_value_taken(class_id, &prop.key, value, &own_ids)
                                .await?
                        {
                            issues.push(ValidationIssue::new(
                                prop.key.clone(),
                                "value is already in use",
                                "unique",
                            ));
                        }
                    }
                }
            }

            // always re-copy id and class_id from the input
            if input.id.is_some() {
                result.id = input.id.clone();
            }

            // case-insensitive name uniqueness within the class
            if let Some(name) = result.name().map(String::from) {
                if self.name_taken(class_id, &name, &own_ids).await? {
                    issues.push(ValidationIssue::new(
                        "name",
                        format!("name '{}' already exists", name),
                        "unique",
                    ));
                }
            }

            // undeclared input keys ride along as extras
            let declared: HashSet<&str> = props.iter().map(|p| p.key.as_str()).collect();
            for (key, value) in &input.fields {
                if declared.contains(key.as_str()) || ENGINE_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                result.set(key.clone(), value.clone());
            }

            Ok((result, issues))
        })
    }

    async fn build_prop(
        &self,
        class_id: &str,
        prop: &PropDef,
        input: &Record,
        prior: Option<&Record>,
        result: &mut Record,
        issues: &mut Vec<ValidationIssue>,
    ) -> EngineResult<()> {
        let key = prop.key.as_str();
        let Some(raw) = input.get(key) else {
            // missing: default on create, then the required check
            if prior.is_none() {
                if let Some(default) = &prop.default_value {
                    result.set(key.to_string(), default.clone());
                }
            }
            if prop.required && value_is_unset(result.get(key)) {
                issues.push(ValidationIssue::new(key, "is required", "required"));
            }
            return Ok(());
        };

        // server-controlled props ignore caller input
        if prop.readonly && !crate::schema::is_system_class(class_id) {
            return Ok(());
        }
        if prop.create_only && prior.is_some() {
            return Ok(());
        }

        if raw.is_null() {
            result.set(key.to_string(), Value::Null);
            if prop.required {
                issues.push(ValidationIssue::new(key, "is required", "required"));
            }
            return Ok(());
        }

        if prop.is_array {
            let Some(items) = raw.as_array() else {
                issues.push(ValidationIssue::new(
                    key,
                    format!("expected an array, got {}", type_name(raw)),
                    "type",
                ));
                return Ok(());
            };

            let built = if prop.data_type == DataType::Object && !prop.object_class_id.is_empty()
            {
                self.build_embedded_array(prop, items, prior, issues).await?
            } else if prop.data_type == DataType::Relation {
                self.build_relation_array(class_id, prop, items, issues).await?
            } else if is_freeform(prop) {
                // untargeted object props hold arbitrary values
                items.to_vec()
            } else {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match cast_value(item, prop.data_type) {
                        Ok(value) => out.push(value),
                        Err(message) => issues.push(ValidationIssue::new(
                            format!("{}[{}]", key, i),
                            message,
                            "type",
                        )),
                    }
                }
                out
            };

            let array = Value::Array(built);
            self.run_rules(prop, &array, issues);
            result.set(key.to_string(), array);
            return Ok(());
        }

        match prop.data_type {
            DataType::Object if !prop.object_class_id.is_empty() && raw.is_object() => {
                let target = embedded_target(prop, raw);
                if self.registry.get_class(&target).await?.is_some() {
                    let item = value_record(raw, &target);
                    let prior_item = prior
                        .and_then(|p| p.get(key))
                        .and_then(|v| v.as_object().cloned())
                        .map(|obj| value_record(&Value::Object(obj), &target));

                    let (built, sub_issues) = self
                        .validate_and_build(&target, &item, prior_item.as_ref())
                        .await?;
                    issues.extend(sub_issues.into_iter().map(|i| i.nested_under(key)));
                    result.set(key.to_string(), built.to_value());
                } else {
                    // unknown target class: store the mapping as-is
                    result.set(key.to_string(), raw.clone());
                }
            }
            DataType::Relation => {
                match cast_value(raw, DataType::Relation) {
                    Ok(id_value) => {
                        if self.relation_resolves(prop, &id_value).await? {
                            result.set(key.to_string(), id_value);
                        } else {
                            issues.push(ValidationIssue::new(
                                key,
                                format!("related record '{}' does not exist", id_value),
                                "relation",
                            ));
                        }
                    }
                    Err(message) => {
                        issues.push(ValidationIssue::new(key, message, "type"));
                    }
                }
            }
            _ if is_freeform(prop) => {
                // untargeted object props hold arbitrary values
                self.run_rules(prop, raw, issues);
                result.set(key.to_string(), raw.clone());
            }
            _ => match cast_value(raw, prop.data_type) {
                Ok(value) => {
                    self.run_rules(prop, &value, issues);
                    result.set(key.to_string(), value);
                }
                Err(message) => {
                    issues.push(ValidationIssue::new(key, message, "type"));
                }
            },
        }

        Ok(())
    }

    /// Embedded array items match prior items by id; unmatched items
    /// build as new.
    async fn build_embedded_array(
        &self,
        prop: &PropDef,
        items: &[Value],
        prior: Option<&Record>,
        issues: &mut Vec<ValidationIssue>,
    ) -> EngineResult<Vec<Value>> {
        let key = prop.key.as_str();
        let prior_items: Vec<Value> = prior
            .and_then(|p| p.get(key))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut built = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            if !item.is_object() {
                issues.push(ValidationIssue::new(
                    format!("{}[{}]", key, i),
                    format!("expected an object, got {}", type_name(item)),
                    "type",
                ));
                continue;
            }

            let target = embedded_target(prop, item);
            if self.registry.get_class(&target).await?.is_none() {
                built.push(item.clone());
                continue;
            }

            let item_record = value_record(item, &target);
            let prior_match = item
                .get("id")
                .filter(|id| !id.is_null())
                .and_then(|id| {
                    prior_items
                        .iter()
                        .find(|p| p.get("id") == Some(id))
                })
                .map(|v| value_record(v, &target));

            let (sub, sub_issues) = self
                .validate_and_build(&target, &item_record, prior_match.as_ref())
                .await?;
            issues.extend(
                sub_issues
                    .into_iter()
                    .map(|issue| issue.nested_under(&format!("{}[{}]", key, i))),
            );
            built.push(sub.to_value());
        }
        Ok(built)
    }

    async fn build_relation_array(
        &self,
        _class_id: &str,
        prop: &PropDef,
        items: &[Value],
        issues: &mut Vec<ValidationIssue>,
    ) -> EngineResult<Vec<Value>> {
        let key = prop.key.as_str();
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match cast_value(item, DataType::Relation) {
                Ok(id_value) => {
                    if self.relation_resolves(prop, &id_value).await? {
                        out.push(id_value);
                    } else {
                        issues.push(ValidationIssue::new(
                            format!("{}[{}]", key, i),
                            format!("related record '{}' does not exist", id_value),
                            "relation",
                        ));
                    }
                }
                Err(message) => {
                    issues.push(ValidationIssue::new(format!("{}[{}]", key, i), message, "type"));
                }
            }
        }
        Ok(out)
    }

    /// The referenced record must exist in a target class, or in a
    /// subclass of one unless the prop is strict.
    async fn relation_resolves(&self, prop: &PropDef, id_value: &Value) -> EngineResult<bool> {
        if prop.object_class_id.is_empty() {
            return Ok(true);
        }
        let Some(id) = Id::from_value(id_value) else {
            return Ok(false);
        };
        let backend = self.registry.backend();

        for target in &prop.object_class_id {
            if backend.get(target, &id).await?.is_some() {
                return Ok(true);
            }
            if !prop.object_class_strict {
                for subclass in self.registry.subclasses_of(target).await? {
                    if &subclass != target && backend.get(&subclass, &id).await?.is_some() {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn run_rules(&self, prop: &PropDef, value: &Value, issues: &mut Vec<ValidationIssue>) {
        for rule in &prop.validators {
            if is_function_rule(rule) {
                // forwarded to the execution collaborator, never run here
                continue;
            }
            if rule_name(rule).as_deref() == Some("unique") {
                continue;
            }
            if let Err((code, message)) = run_rule(rule, value) {
                issues.push(ValidationIssue::new(prop.key.clone(), message, code));
            }
        }
    }

    fn prop_is_unique(&self, prop: &PropDef) -> bool {
        prop.data_type == DataType::Unique
            || prop
                .validators
                .iter()
                .any(|rule| rule_name(rule).as_deref() == Some("unique"))
    }

    async fn field_value_taken(
        &self,
        class_id: &str,
        key: &str,
        value: &Value,
        own_ids: &[Id],
    ) -> EngineResult<bool> {
        let records = self.registry.backend().get_all(class_id).await?;
        Ok(records.iter().any(|record| {
            record.id.as_ref().map_or(true, |id| !own_ids.contains(id))
                && field_value(record, key).as_ref() == Some(value)
        }))
    }

    async fn name_taken(
        &self,
        class_id: &str,
        name: &str,
        own_ids: &[Id],
    ) -> EngineResult<bool> {
        let records = self.registry.backend().get_all(class_id).await?;
        Ok(records.iter().any(|record| {
            record.id.as_ref().map_or(true, |id| !own_ids.contains(id))
                && record
                    .name()
                    .map_or(false, |other| other.eq_ignore_ascii_case(name))
        }))
    }
}

/// Which target class an embedded value belongs to: its own class_id
/// when that is an allowed target, else the first declared target.
fn embedded_target(prop: &PropDef, value: &Value) -> String {
    if let Some(class_id) = value.get("class_id").and_then(Value::as_str) {
        if prop.object_class_id.iter().any(|t| t == class_id) {
            return class_id.to_string();
        }
    }
    prop.object_class_id
        .first()
        .cloned()
        .unwrap_or_default()
}

fn value_record(value: &Value, class_id: &str) -> Record {
    let mut record =
        Record::from_value(value.clone()).unwrap_or_else(|_| Record::new(class_id));
    record.class_id = class_id.to_string();
    record
}

fn value_is_unset(value: Option<&Value>) -> bool {
    value.map_or(true, Value::is_null)
}

/// An object prop with no target classes is a freeform container;
/// its values pass through uncast.
fn is_freeform(prop: &PropDef) -> bool {
    prop.data_type == DataType::Object && prop.object_class_id.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ClassDef, PropDef, SchemaRegistry, CLASS};
    use crate::storage::{FileBackend, StorageBackend};
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<SchemaRegistry>, ObjectBuilder) {
        let tmp = TempDir::new().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FileBackend::open(tmp.path()).unwrap());
        let registry = Arc::new(SchemaRegistry::new(backend));
        registry.ensure_bootstrap().await.unwrap();
        let builder = ObjectBuilder::new(Arc::clone(&registry));
        (tmp, registry, builder)
    }

    async fn define(registry: &SchemaRegistry, def: ClassDef) {
        registry.backend().set(CLASS, def.to_record()).await.unwrap();
        registry.invalidate(&def.id);
    }

    fn user_class() -> ClassDef {
        ClassDef::new("user", "User").with_props(vec![
            PropDef::string("name").required().order(1),
            PropDef::string("email").order(2),
            PropDef::integer("age").order(3),
        ])
    }

    #[tokio::test]
    async fn test_build_casts_and_merges() {
        let (_tmp, registry, builder) = setup().await;
        define(&registry, user_class()).await;

        let input = Record::from_value(json!({
            "class_id": "user",
            "name": "Alice",
            "age": "30"
        }))
        .unwrap();

        let (record, issues) = builder
            .validate_and_build("user", &input, None)
            .await
            .unwrap();
        assert!(issues.is_empty(), "unexpected issues: {:?}", issues);
        assert_eq!(record.get("age"), Some(&json!(30)));
    }

    #[tokio::test]
    async fn test_missing_required_collects_issue() {
        let (_tmp, registry, builder) = setup().await;
        define(&registry, user_class()).await;

        let input = Record::from_value(json!({"class_id": "user", "email": "x"})).unwrap();
        let (_, issues) = builder
            .validate_and_build("user", &input, None)
            .await
            .unwrap();

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "name");
        assert_eq!(issues[0].code, "required");
    }

    #[tokio::test]
    async fn test_update_merges_over_prior() {
        let (_tmp, registry, builder) = setup().await;
        define(&registry, user_class()).await;

        let prior = Record::from_value(json!({
            "id": 1,
            "class_id": "user",
            "name": "Alice",
            "email": "a@b.co"
        }))
        .unwrap();
        let input = Record::from_value(json!({
            "id": 1,
            "class_id": "user",
            "age": 31
        }))
        .unwrap();

        let (record, issues) = builder
            .validate_and_build("user", &input, Some(&prior))
            .await
            .unwrap();
        assert!(issues.is_empty());
        // untouched fields survive the merge
        assert_eq!(record.get("name"), Some(&json!("Alice")));
        assert_eq!(record.get("email"), Some(&json!("a@b.co")));
        assert_eq!(record.get("age"), Some(&json!(31)));
    }

    #[tokio::test]
    async fn test_build_is_stable_on_prior() {
        let (_tmp, registry, builder) = setup().await;
        define(&registry, user_class()).await;

        let input = Record::from_value(json!({
            "class_id": "user",
            "name": "Alice",
            "age": "30"
        }))
        .unwrap();
        let (first, _) = builder.validate_and_build("user", &input, None).await.unwrap();

        let (second, issues) = builder
            .validate_and_build("user", &first, Some(&first))
            .await
            .unwrap();
        assert!(issues.is_empty());
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_array_type_enforced() {
        let (_tmp, registry, builder) = setup().await;
        define(
            &registry,
            ClassDef::new("post", "Post")
                .with_props(vec![PropDef::string("tags").array()]),
        )
        .await;

        let input = Record::from_value(json!({"class_id": "post", "tags": "a"})).unwrap();
        let (_, issues) = builder.validate_and_build("post", &input, None).await.unwrap();
        assert_eq!(issues[0].code, "type");

        let input =
            Record::from_value(json!({"class_id": "post", "tags": ["a", 2]})).unwrap();
        let (record, issues) = builder.validate_and_build("post", &input, None).await.unwrap();
        assert!(issues.is_empty());
        // element-wise cast: 2 -> "2"
        assert_eq!(record.get("tags"), Some(&json!(["a", "2"])));
    }

    #[tokio::test]
    async fn test_embedded_object_recursion_prefixes_paths() {
        let (_tmp, registry, builder) = setup().await;
        define(
            &registry,
            ClassDef::new("address", "Address")
                .with_props(vec![PropDef::string("city").required()]),
        )
        .await;
        define(
            &registry,
            ClassDef::new("person", "Person").with_props(vec![
                PropDef::string("name").required(),
                PropDef::new("address", DataType::Object).targets(vec!["address".into()]),
            ]),
        )
        .await;

        let input = Record::from_value(json!({
            "class_id": "person",
            "name": "Ann",
            "address": { "zip": "10001" }
        }))
        .unwrap();

        let (_, issues) = builder
            .validate_and_build("person", &input, None)
            .await
            .unwrap();
        assert!(issues.iter().any(|i| i.path == "address.city" && i.code == "required"));
    }

    #[tokio::test]
    async fn test_relation_must_resolve() {
        let (_tmp, registry, builder) = setup().await;
        define(&registry, user_class()).await;
        define(
            &registry,
            ClassDef::new("task", "Task").with_props(vec![
                PropDef::string("title").required(),
                PropDef::relation("assignee", "user"),
            ]),
        )
        .await;

        let input = Record::from_value(json!({
            "class_id": "task",
            "title": "Fix",
            "assignee": 42
        }))
        .unwrap();
        let (_, issues) = builder.validate_and_build("task", &input, None).await.unwrap();
        assert!(issues.iter().any(|i| i.path == "assignee" && i.code == "relation"));

        // now create the target and retry
        let user = Record::from_value(json!({"id": 42, "class_id": "user", "name": "A"})).unwrap();
        registry.backend().set("user", user).await.unwrap();

        let (record, issues) = builder.validate_and_build("task", &input, None).await.unwrap();
        assert!(issues.is_empty());
        assert_eq!(record.get("assignee"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_relation_accepts_subclass_unless_strict() {
        let (_tmp, registry, builder) = setup().await;
        define(&registry, user_class()).await;
        define(
            &registry,
            ClassDef::new("admin", "Admin").extending("user"),
        )
        .await;

        let admin =
            Record::from_value(json!({"id": "adm1", "class_id": "admin", "name": "Root"}))
                .unwrap();
        registry.backend().set("admin", admin).await.unwrap();

        define(
            &registry,
            ClassDef::new("task", "Task")
                .with_props(vec![PropDef::relation("assignee", "user")]),
        )
        .await;

        let input =
            Record::from_value(json!({"class_id": "task", "assignee": "adm1"})).unwrap();
        let (_, issues) = builder.validate_and_build("task", &input, None).await.unwrap();
        assert!(issues.is_empty(), "subclass target should resolve: {:?}", issues);

        // strict forbids the subclass
        let mut strict_prop = PropDef::relation("assignee", "user");
        strict_prop.object_class_strict = true;
        define(
            &registry,
            ClassDef::new("task", "Task").with_props(vec![strict_prop]),
        )
        .await;

        let (_, issues) = builder.validate_and_build("task", &input, None).await.unwrap();
        assert!(issues.iter().any(|i| i.code == "relation"));
    }

    #[tokio::test]
    async fn test_default_applied_on_create_only() {
        let (_tmp, registry, builder) = setup().await;
        define(
            &registry,
            ClassDef::new("doc", "Doc").with_props(vec![
                PropDef::string("status").with_default(json!("draft")),
            ]),
        )
        .await;

        let input = Record::from_value(json!({"class_id": "doc"})).unwrap();
        let (record, _) = builder.validate_and_build("doc", &input, None).await.unwrap();
        assert_eq!(record.get("status"), Some(&json!("draft")));

        // on update, absence means "leave alone", not "re-default"
        let mut prior = record.clone();
        prior.set("status", json!("live"));
        let (updated, _) = builder
            .validate_and_build("doc", &input, Some(&prior))
            .await
            .unwrap();
        assert_eq!(updated.get("status"), Some(&json!("live")));
    }

    #[tokio::test]
    async fn test_name_uniqueness_case_insensitive() {
        let (_tmp, registry, builder) = setup().await;
        define(&registry, user_class()).await;

        let existing =
            Record::from_value(json!({"id": 1, "class_id": "user", "name": "Alice"})).unwrap();
        registry.backend().set("user", existing).await.unwrap();

        let input = Record::from_value(json!({"class_id": "user", "name": "ALICE"})).unwrap();
        let (_, issues) = builder.validate_and_build("user", &input, None).await.unwrap();
        assert!(issues.iter().any(|i| i.path == "name" && i.code == "unique"));

        // updating the same record keeps its own name
        let input =
            Record::from_value(json!({"id": 1, "class_id": "user", "name": "Alice"})).unwrap();
        let prior = registry
            .backend()
            .get("user", &Id::Int(1))
            .await
            .unwrap()
            .unwrap();
        let (_, issues) = builder
            .validate_and_build("user", &input, Some(&prior))
            .await
            .unwrap();
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn test_rule_validators_run() {
        let (_tmp, registry, builder) = setup().await;
        let mut email = PropDef::string("email");
        email.validators = vec![json!("email")];
        define(
            &registry,
            ClassDef::new("contact", "Contact").with_props(vec![email]),
        )
        .await;

        let input =
            Record::from_value(json!({"class_id": "contact", "email": "nope"})).unwrap();
        let (_, issues) = builder
            .validate_and_build("contact", &input, None)
            .await
            .unwrap();
        assert!(issues.iter().any(|i| i.code == "email"));
    }

    #[tokio::test]
    async fn test_extras_ride_along_but_engine_fields_do_not() {
        let (_tmp, registry, builder) = setup().await;
        define(&registry, user_class()).await;

        let input = Record::from_value(json!({
            "class_id": "user",
            "name": "Alice",
            "nickname": "Al",
            "owner_id": "intruder"
        }))
        .unwrap();

        let (record, _) = builder.validate_and_build("user", &input, None).await.unwrap();
        assert_eq!(record.get("nickname"), Some(&json!("Al")));
        assert_eq!(record.get("owner_id"), None);
    }

    #[tokio::test]
    async fn test_unique_data_type_checks_backend() {
        let (_tmp, registry, builder) = setup().await;
        define(
            &registry,
            ClassDef::new("account", "Account")
                .with_props(vec![PropDef::new("slug", DataType::Unique)]),
        )
        .await;

        let taken =
            Record::from_value(json!({"id": 1, "class_id": "account", "slug": "home"}))
                .unwrap();
        registry.backend().set("account", taken).await.unwrap();

        let input =
            Record::from_value(json!({"class_id": "account", "slug": "home"})).unwrap();
        let (_, issues) = builder
            .validate_and_build("account", &input, None)
            .await
            .unwrap();
        assert!(issues.iter().any(|i| i.path == "slug" && i.code == "unique"));
    }
}
