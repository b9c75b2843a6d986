//! Relation and orphan engine
//!
//! Resolves reference relations, unlinks target ids from parents, and
//! detects or cleans up orphans: records of a class that no relation
//! property anywhere still points at.

use std::collections::HashSet;

use serde_json::Value;

use crate::core::context::SecurityContext;
use crate::core::error::{EngineError, EngineResult};
use crate::core::record::{Id, Record};
use crate::engine::Engine;
use crate::schema::{DataType, OnOrphan, PropDef};
use crate::storage::{Filter, QueryOptions};

/// How related records are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelatedMode {
    /// Read the ids stored on the parent and fetch each in declared
    /// order, skipping missing ids
    Resolve,
    /// Full query over the target classes with caller filters
    Query,
}

pub struct Relations<'a> {
    engine: &'a Engine,
}

impl<'a> Relations<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Fetch the records a relation property points at.
    pub async fn get_related(
        &self,
        parent: &Record,
        key: &str,
        mode: RelatedMode,
        filters: &[Filter],
        options: &QueryOptions,
        ctx: &SecurityContext,
    ) -> EngineResult<Vec<Record>> {
        let prop = self.relation_prop(&parent.class_id, key).await?;

        match mode {
            RelatedMode::Resolve => {
                let mut related = Vec::new();
                for id in relation_ids(parent.get(key)) {
                    if let Some((_, record)) = self.find_target(&prop, &id, ctx).await? {
                        related.push(record);
                    }
                    // missing ids are skipped, not errors
                }
                Ok(related)
            }
            RelatedMode::Query => {
                let mut related = Vec::new();
                for target in self.target_classes(&prop).await? {
                    let mut page = self
                        .engine
                        .query_objects(&target, filters, options, ctx)
                        .await?;
                    related.append(&mut page);
                }
                Ok(related)
            }
        }
    }

    /// Remove ids from a parent's relation field, write the parent,
    /// then apply the delete policy to each removed target.
    pub async fn unlink(
        &self,
        class_id: &str,
        parent_id: &Id,
        key: &str,
        removed_ids: &[Id],
        delete_objects: bool,
        ctx: &SecurityContext,
    ) -> EngineResult<Record> {
        let prop = self.relation_prop(class_id, key).await?;

        let Some(parent) = self.engine.get_object(class_id, parent_id, ctx).await? else {
            return Err(EngineError::not_found(class_id, parent_id));
        };

        let removed: HashSet<String> = removed_ids.iter().map(|id| id.to_string()).collect();
        let new_value = match parent.get(key) {
            Some(Value::Array(items)) => Value::Array(
                items
                    .iter()
                    .filter(|v| {
                        Id::from_value(v).map_or(true, |id| !removed.contains(&id.to_string()))
                    })
                    .cloned()
                    .collect(),
            ),
            Some(other) => {
                let keep = Id::from_value(other)
                    .map_or(true, |id| !removed.contains(&id.to_string()));
                if keep {
                    other.clone()
                } else {
                    Value::Null
                }
            }
            None => Value::Null,
        };

        let input = Record::new(class_id)
            .with_id(parent_id.clone())
            .with_field(key, new_value);
        let written = self.engine.set_object(class_id, input, ctx).await?;

        for id in removed_ids {
            let Some((target_class, _)) = self.find_target(&prop, id, ctx).await? else {
                continue;
            };
            if delete_objects {
                self.engine.delete_object(&target_class, id, ctx).await?;
            } else if prop.on_orphan == OnOrphan::Delete
                && self.is_orphan(&target_class, id).await?
            {
                self.engine.delete_object(&target_class, id, ctx).await?;
            }
        }

        Ok(written)
    }

    /// Records of `class_id` that no relation property anywhere still
    /// references.
    pub async fn find_orphans(
        &self,
        class_id: &str,
        ctx: &SecurityContext,
    ) -> EngineResult<Vec<Record>> {
        let referenced = self.referenced_ids(class_id).await?;
        let records = self.engine.list_objects(class_id, ctx).await?;
        Ok(records
            .into_iter()
            .filter(|r| {
                r.id_string()
                    .map_or(true, |id| !referenced.contains(&id))
            })
            .collect())
    }

    /// Delete every orphan of a class; returns how many went.
    pub async fn cleanup_orphans(
        &self,
        class_id: &str,
        ctx: &SecurityContext,
    ) -> EngineResult<u64> {
        let orphans = self.find_orphans(class_id, ctx).await?;
        let mut count = 0u64;
        for orphan in orphans {
            if let Some(id) = &orphan.id {
                self.engine.delete_object(class_id, id, ctx).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Whether nothing references `(class_id, id)` any more.
    pub async fn is_orphan(&self, class_id: &str, id: &Id) -> EngineResult<bool> {
        let referenced = self.referenced_ids(class_id).await?;
        Ok(!referenced.contains(&id.to_string()))
    }

    /// Clear a deleted record's id out of every nullify-policy
    /// relation field that referenced it.
    pub async fn detach_references(
        &self,
        target: &Record,
        ctx: &SecurityContext,
    ) -> EngineResult<u64> {
        let Some(target_id) = target.id.clone() else {
            return Ok(0);
        };
        let target_key = target_id.to_string();
        let target_ancestors = match self.engine.registry().get_class(&target.class_id).await? {
            Some(meta) => meta.ancestors.clone(),
            None => Vec::new(),
        };
        let mut detached = 0u64;

        for def in self.engine.registry().all_classes().await? {
            let Some(meta) = self.engine.registry().get_class(&def.id).await? else {
                continue;
            };
            let nullify_props: Vec<PropDef> = meta
                .effective_props
                .iter()
                .filter(|p| {
                    p.data_type == DataType::Relation
                        && p.on_orphan == OnOrphan::Nullify
                        && self.prop_targets_class_sync(p, &target.class_id, &target_ancestors)
                })
                .cloned()
                .collect();
            if nullify_props.is_empty() {
                continue;
            }

            for record in self.engine.list_objects(&def.id, ctx).await? {
                for prop in &nullify_props {
                    if !value_references(record.get(&prop.key), &target_key) {
                        continue;
                    }
                    let Some(parent_id) = record.id.clone() else { continue };
                    self.unlink(
                        &def.id,
                        &parent_id,
                        &prop.key,
                        std::slice::from_ref(&target_id),
                        false,
                        ctx,
                    )
                    .await?;
                    detached += 1;
                }
            }
        }
        Ok(detached)
    }

    async fn relation_prop(&self, class_id: &str, key: &str) -> EngineResult<PropDef> {
        let Some(meta) = self.engine.registry().get_class(class_id).await? else {
            return Err(EngineError::not_found("@class", class_id));
        };
        let Some(prop) = meta.prop(key) else {
            return Err(EngineError::InvalidRelation {
                class_id: class_id.to_string(),
                prop: key.to_string(),
            });
        };
        if prop.data_type != DataType::Relation {
            return Err(EngineError::InvalidRelation {
                class_id: class_id.to_string(),
                prop: key.to_string(),
            });
        }
        Ok(prop.clone())
    }

    /// The classes a relation prop accepts, subclasses included unless
    /// strict, in declared order.
    async fn target_classes(&self, prop: &PropDef) -> EngineResult<Vec<String>> {
        let mut targets = Vec::new();
        for declared in &prop.object_class_id {
            if !targets.contains(declared) {
                targets.push(declared.clone());
            }
            if !prop.object_class_strict {
                for subclass in self.engine.registry().subclasses_of(declared).await? {
                    if !targets.contains(&subclass) {
                        targets.push(subclass);
                    }
                }
            }
        }
        Ok(targets)
    }

    async fn find_target(
        &self,
        prop: &PropDef,
        id: &Id,
        ctx: &SecurityContext,
    ) -> EngineResult<Option<(String, Record)>> {
        for target in self.target_classes(prop).await? {
            if let Some(record) = self.engine.get_object(&target, id, ctx).await? {
                return Ok(Some((target, record)));
            }
        }
        Ok(None)
    }

    /// Ids of `class_id` records referenced from any relation prop that
    /// targets the class or one of its ancestors.
    async fn referenced_ids(&self, class_id: &str) -> EngineResult<HashSet<String>> {
        let ancestors = match self.engine.registry().get_class(class_id).await? {
            Some(meta) => meta.ancestors.clone(),
            None => Vec::new(),
        };

        let mut referenced = HashSet::new();
        for def in self.engine.registry().all_classes().await? {
            let Some(meta) = self.engine.registry().get_class(&def.id).await? else {
                continue;
            };
            let relevant: Vec<&PropDef> = meta
                .effective_props
                .iter()
                .filter(|p| {
                    p.data_type == DataType::Relation
                        && self.prop_targets_class_sync(p, class_id, &ancestors)
                })
                .collect();
            if relevant.is_empty() {
                continue;
            }

            for record in self.engine.backend().get_all(&def.id).await? {
                for prop in &relevant {
                    for id in relation_ids(record.get(&prop.key)) {
                        referenced.insert(id.to_string());
                    }
                }
            }
        }
        Ok(referenced)
    }

    /// Whether a relation prop can point at records of `class_id`:
    /// it targets the class itself, or (unless strict) an ancestor.
    fn prop_targets_class_sync(
        &self,
        prop: &PropDef,
        class_id: &str,
        ancestors: &[String],
    ) -> bool {
        prop.object_class_id.iter().any(|t| {
            t == class_id || (!prop.object_class_strict && ancestors.iter().any(|a| a == t))
        })
    }
}

/// The id (or ids) stored on a relation field.
fn relation_ids(value: Option<&Value>) -> Vec<Id> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(Id::from_value).collect(),
        Some(other) => Id::from_value(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn value_references(value: Option<&Value>, target_key: &str) -> bool {
    relation_ids(value)
        .iter()
        .any(|id| id.to_string() == target_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ClassDef, CLASS};
    use crate::storage::{FileBackend, StorageBackend};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Engine) {
        let tmp = TempDir::new().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FileBackend::open(tmp.path()).unwrap());
        let registry = Arc::new(crate::schema::SchemaRegistry::new(backend));
        let engine = Engine::new(registry);
        (tmp, engine)
    }

    async fn define(engine: &Engine, def: ClassDef) {
        engine
            .set_object(CLASS, def.to_record(), &SecurityContext::system())
            .await
            .unwrap();
    }

    async fn tag_and_post_classes(engine: &Engine, on_orphan: OnOrphan) {
        define(
            engine,
            ClassDef::new("tag", "Tag").with_props(vec![PropDef::string("name")]),
        )
        .await;

        let mut tags = PropDef::relation("tags", "tag").array();
        tags.on_orphan = on_orphan;
        define(
            engine,
            ClassDef::new("post", "Post")
                .with_props(vec![PropDef::string("title"), tags]),
        )
        .await;
    }

    async fn create(engine: &Engine, class_id: &str, value: serde_json::Value) -> Record {
        let input = Record::from_value(value).unwrap();
        engine
            .set_object(class_id, input, &SecurityContext::system())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_preserves_order_and_skips_missing() {
        let (_tmp, engine) = setup().await;
        tag_and_post_classes(&engine, OnOrphan::Keep).await;
        let ctx = SecurityContext::system();

        let t1 = create(&engine, "tag", json!({"name": "one"})).await;
        let t2 = create(&engine, "tag", json!({"name": "two"})).await;
        let post = create(
            &engine,
            "post",
            json!({
                "title": "p",
                "tags": [t2.id.clone().unwrap().to_value(), t1.id.clone().unwrap().to_value()]
            }),
        )
        .await;

        let relations = Relations::new(&engine);
        let related = relations
            .get_related(&post, "tags", RelatedMode::Resolve, &[], &QueryOptions::default(), &ctx)
            .await
            .unwrap();

        let names: Vec<_> = related
            .iter()
            .map(|r| r.get("name").unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["two", "one"]);

        // a dangling id is skipped, not an error
        engine
            .backend()
            .delete("tag", t1.id.as_ref().unwrap())
            .await
            .unwrap();
        let related = relations
            .get_related(&post, "tags", RelatedMode::Resolve, &[], &QueryOptions::default(), &ctx)
            .await
            .unwrap();
        assert_eq!(related.len(), 1);
    }

    #[tokio::test]
    async fn test_non_relation_prop_is_invalid_relation() {
        let (_tmp, engine) = setup().await;
        tag_and_post_classes(&engine, OnOrphan::Keep).await;

        let post = create(&engine, "post", json!({"title": "p"})).await;
        let relations = Relations::new(&engine);
        let err = relations
            .get_related(
                &post,
                "title",
                RelatedMode::Resolve,
                &[],
                &QueryOptions::default(),
                &SecurityContext::system(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::core::ErrorCode::InvalidRelation);
    }

    #[tokio::test]
    async fn test_unlink_removes_ids_and_keeps_targets_by_default() {
        let (_tmp, engine) = setup().await;
        tag_and_post_classes(&engine, OnOrphan::Keep).await;
        let ctx = SecurityContext::system();

        let tag = create(&engine, "tag", json!({"name": "one"})).await;
        let tag_id = tag.id.clone().unwrap();
        let post = create(
            &engine,
            "post",
            json!({"title": "p", "tags": [tag_id.to_value()]}),
        )
        .await;

        let relations = Relations::new(&engine);
        let written = relations
            .unlink(
                "post",
                post.id.as_ref().unwrap(),
                "tags",
                std::slice::from_ref(&tag_id),
                false,
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(written.get("tags"), Some(&json!([])));
        // keep policy: the tag survives
        assert!(engine.get_object("tag", &tag_id, &ctx).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unlink_deletes_orphan_under_delete_policy() {
        let (_tmp, engine) = setup().await;
        tag_and_post_classes(&engine, OnOrphan::Delete).await;
        let ctx = SecurityContext::system();

        let tag = create(&engine, "tag", json!({"name": "one"})).await;
        let tag_id = tag.id.clone().unwrap();
        let post = create(
            &engine,
            "post",
            json!({"title": "p", "tags": [tag_id.to_value()]}),
        )
        .await;

        let relations = Relations::new(&engine);
        relations
            .unlink(
                "post",
                post.id.as_ref().unwrap(),
                "tags",
                std::slice::from_ref(&tag_id),
                false,
                &ctx,
            )
            .await
            .unwrap();

        // the tag became an orphan and the policy removed it
        assert!(engine.get_object("tag", &tag_id, &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlink_keeps_target_still_referenced_elsewhere() {
        let (_tmp, engine) = setup().await;
        tag_and_post_classes(&engine, OnOrphan::Delete).await;
        let ctx = SecurityContext::system();

        let tag = create(&engine, "tag", json!({"name": "shared"})).await;
        let tag_id = tag.id.clone().unwrap();
        let post1 = create(
            &engine,
            "post",
            json!({"title": "a", "tags": [tag_id.to_value()]}),
        )
        .await;
        let _post2 = create(
            &engine,
            "post",
            json!({"title": "b", "tags": [tag_id.to_value()]}),
        )
        .await;

        let relations = Relations::new(&engine);
        relations
            .unlink(
                "post",
                post1.id.as_ref().unwrap(),
                "tags",
                std::slice::from_ref(&tag_id),
                false,
                &ctx,
            )
            .await
            .unwrap();

        // still referenced by post2, so not an orphan, so kept
        assert!(engine.get_object("tag", &tag_id, &ctx).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_explicit_delete_overrides_policy() {
        let (_tmp, engine) = setup().await;
        tag_and_post_classes(&engine, OnOrphan::Keep).await;
        let ctx = SecurityContext::system();

        let tag = create(&engine, "tag", json!({"name": "x"})).await;
        let tag_id = tag.id.clone().unwrap();
        let post = create(
            &engine,
            "post",
            json!({"title": "p", "tags": [tag_id.to_value()]}),
        )
        .await;

        let relations = Relations::new(&engine);
        relations
            .unlink(
                "post",
                post.id.as_ref().unwrap(),
                "tags",
                std::slice::from_ref(&tag_id),
                true,
                &ctx,
            )
            .await
            .unwrap();

        assert!(engine.get_object("tag", &tag_id, &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_and_cleanup_orphans() {
        let (_tmp, engine) = setup().await;
        tag_and_post_classes(&engine, OnOrphan::Keep).await;
        let ctx = SecurityContext::system();

        let used = create(&engine, "tag", json!({"name": "used"})).await;
        let orphan = create(&engine, "tag", json!({"name": "orphan"})).await;
        create(
            &engine,
            "post",
            json!({"title": "p", "tags": [used.id.clone().unwrap().to_value()]}),
        )
        .await;

        let relations = Relations::new(&engine);
        let orphans = relations.find_orphans("tag", &ctx).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, orphan.id);

        let removed = relations.cleanup_orphans("tag", &ctx).await.unwrap();
        assert_eq!(removed, 1);
        assert!(engine
            .get_object("tag", orphan.id.as_ref().unwrap(), &ctx)
            .await
            .unwrap()
            .is_none());
        assert!(engine
            .get_object("tag", used.id.as_ref().unwrap(), &ctx)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_subclass_reference_counts_against_orphanhood() {
        let (_tmp, engine) = setup().await;
        let ctx = SecurityContext::system();

        define(
            &engine,
            ClassDef::new("asset", "Asset").with_props(vec![PropDef::string("name")]),
        )
        .await;
        define(&engine, ClassDef::new("image", "Image").extending("asset")).await;
        // gallery links to the base class; an image referenced through
        // it is not an orphan
        define(
            &engine,
            ClassDef::new("gallery", "Gallery")
                .with_props(vec![PropDef::relation("cover", "asset")]),
        )
        .await;

        let image = create(&engine, "image", json!({"name": "pic"})).await;
        create(
            &engine,
            "gallery",
            json!({"cover": image.id.clone().unwrap().to_value()}),
        )
        .await;

        let relations = Relations::new(&engine);
        let orphans = relations.find_orphans("image", &ctx).await.unwrap();
        assert!(orphans.is_empty());
    }
}
