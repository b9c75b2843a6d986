//! Write engine
//!
//! The single write path. Every write resolves the class, fetches the
//! prior state, runs the existence and security guards, validates and
//! merges, diffs, persists, and then triggers the schema side effects
//! (rename propagation, cache invalidation) and the broadcast.

use std::sync::Arc;

use serde_json::Value;

use crate::bus::event::{delete_item, write_item, ChangeBatch};
use crate::bus::producer::BroadcastProducer;
use crate::core::context::SecurityContext;
use crate::core::error::{EngineError, EngineResult};
use crate::core::record::{Id, Record, CREATED_BY, UPDATED_BY};
use crate::observability::Logger;
use crate::schema::types::normalize_props_value;
use crate::schema::{is_system_class, ClassDef, SchemaRegistry, CLASS, PROP};
use crate::storage::{Filter, QueryOptions, StorageBackend};
use crate::validation::ObjectBuilder;

use super::diff::diff_records;
use super::rename::{apply_renames, plan_renames};

pub struct Engine {
    registry: Arc<SchemaRegistry>,
    builder: ObjectBuilder,
    producer: Option<Arc<BroadcastProducer>>,
    auto_create_class: bool,
}

impl Engine {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        let builder = ObjectBuilder::new(Arc::clone(&registry));
        Self {
            registry,
            builder,
            producer: None,
            auto_create_class: false,
        }
    }

    /// Attach the broadcast producer. Without one, writes commit
    /// silently.
    pub fn with_producer(mut self, producer: Arc<BroadcastProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Synthesize a minimal class on first write to an unknown class.
    pub fn with_auto_create_class(mut self, enabled: bool) -> Self {
        self.auto_create_class = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        self.registry.backend()
    }

    /// Create or update a record.
    pub async fn set_object(
        &self,
        class_id: &str,
        input: Record,
        ctx: &SecurityContext,
    ) -> EngineResult<Record> {
        self.set_object_at(class_id, input, None, ctx).await
    }

    /// Create or update a record addressed by `at_id` (the REST path
    /// id). For `@class` writes the body id may differ from `at_id`;
    /// that difference is a class rename.
    pub async fn set_object_at(
        &self,
        class_id: &str,
        input: Record,
        at_id: Option<Id>,
        ctx: &SecurityContext,
    ) -> EngineResult<Record> {
        if self.registry.get_class(class_id).await?.is_none() {
            if self.auto_create_class && !is_system_class(class_id) {
                let minimal = ClassDef::new(class_id, class_id);
                self.write_record(CLASS, minimal.to_record(), None, ctx).await?;
                self.registry.invalidate(class_id);
            } else {
                return Err(EngineError::not_found(CLASS, class_id));
            }
        }
        self.write_record(class_id, input, at_id, ctx).await
    }

    async fn write_record(
        &self,
        class_id: &str,
        mut input: Record,
        at_id: Option<Id>,
        ctx: &SecurityContext,
    ) -> EngineResult<Record> {
        // accept `props` as a mapping on class writes
        if class_id == CLASS {
            let mut value = input.to_value();
            normalize_props_value(&mut value);
            input = Record::from_value(value)
                .map_err(|e| EngineError::InvalidParams(format!("malformed class record: {}", e)))?;
        }

        // ids are immutable except through a class rename
        let lookup_id = match at_id {
            Some(path_id) => {
                if class_id != CLASS {
                    input.id = Some(path_id.clone());
                }
                Some(path_id)
            }
            None => input.id.clone(),
        };

        let prior = match &lookup_id {
            Some(id) => self.backend().get(class_id, id).await?,
            None => None,
        };

        // existence guard: an explicit id must name an existing record
        // unless custom-id creation is enabled
        if let Some(id) = &lookup_id {
            if prior.is_none() && !is_system_class(class_id) && !ctx.allow_custom_ids {
                return Err(EngineError::not_found(class_id, id));
            }
        }

        // security guard
        if let Some(prior) = &prior {
            if !ctx.can_access(prior) {
                return Err(EngineError::Forbidden(format!(
                    "security context does not match '{}/{}'",
                    class_id,
                    prior.id_string().unwrap_or_default()
                )));
            }
        }

        let (mut merged, issues) = self
            .builder
            .validate_and_build(class_id, &input, prior.as_ref())
            .await?;
        if !issues.is_empty() {
            return Err(EngineError::ValidationFailed {
                class_id: class_id.to_string(),
                issues,
            });
        }

        // creation stamps for non-system classes
        if prior.is_none() && !is_system_class(class_id) {
            ctx.stamp(&mut merged);
        }

        let changes = diff_records(&merged, prior.as_ref());
        if changes.is_empty() {
            // no-op write: no persist, no broadcast
            return Ok(prior.unwrap_or(merged));
        }

        if let Some(user_id) = &ctx.user_id {
            if prior.is_none() {
                merged.set(CREATED_BY, Value::from(user_id.clone()));
            }
            merged.set(UPDATED_BY, Value::from(user_id.clone()));
        }

        let stored = self.backend().set(class_id, merged).await?;

        if class_id == CLASS {
            self.propagate_class_write(&stored, prior.as_ref()).await?;
        } else if class_id == PROP {
            // independent prop records shape their owning class
            if let Some((owner, _)) = stored.id_string().as_deref().and_then(|s| {
                s.split_once('.').map(|(a, b)| (a.to_string(), b.to_string()))
            }) {
                self.registry.invalidate(&owner);
            }
        }

        Logger::info(
            "OBJECT_WRITTEN",
            &[
                ("class", class_id),
                ("id", &stored.id_string().unwrap_or_default()),
                ("changes", &changes.len().to_string()),
            ],
        );

        self.broadcast(write_item(&stored, prior.as_ref()), ctx);
        Ok(stored)
    }

    /// Rename propagation and cache invalidation after a `@class`
    /// write. The class record is committed at this point; failures
    /// here surface as storage errors and are logged for operator
    /// reconciliation.
    async fn propagate_class_write(
        &self,
        stored: &Record,
        prior: Option<&Record>,
    ) -> EngineResult<()> {
        if let Some(prior) = prior {
            let plan = plan_renames(prior, stored);
            if !plan.is_empty() {
                if let Some((old_class_id, _)) = &plan.class_rename {
                    // the class record moved to its new id; retire the old one
                    self.backend()
                        .delete(CLASS, &Id::Str(old_class_id.clone()))
                        .await?;
                    self.registry.invalidate(old_class_id);
                }
                apply_renames(self.backend(), &plan).await?;
            }
        }
        if let Some(id) = stored.id_string() {
            self.registry.invalidate(&id);
        }
        Ok(())
    }

    /// Read a record. Records stamped for another security context are
    /// invisible, not forbidden.
    pub async fn get_object(
        &self,
        class_id: &str,
        id: &Id,
        ctx: &SecurityContext,
    ) -> EngineResult<Option<Record>> {
        let Some(record) = self.backend().get(class_id, id).await? else {
            return Ok(None);
        };
        if !ctx.can_access(&record) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub async fn list_objects(
        &self,
        class_id: &str,
        ctx: &SecurityContext,
    ) -> EngineResult<Vec<Record>> {
        let records = self.backend().get_all(class_id).await?;
        Ok(records.into_iter().filter(|r| ctx.can_access(r)).collect())
    }

    pub async fn query_objects(
        &self,
        class_id: &str,
        filters: &[Filter],
        options: &QueryOptions,
        ctx: &SecurityContext,
    ) -> EngineResult<Vec<Record>> {
        let records = self.backend().query(class_id, filters, options).await?;
        Ok(records.into_iter().filter(|r| ctx.can_access(r)).collect())
    }

    /// Cross-class lookup by id, first match in class order.
    pub async fn find_object(
        &self,
        id: &Id,
        ctx: &SecurityContext,
    ) -> EngineResult<Option<Record>> {
        for def in self.registry.all_classes().await? {
            if let Some(record) = self.get_object(&def.id, id, ctx).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Delete a record, mirroring the write-side security guard.
    pub async fn delete_object(
        &self,
        class_id: &str,
        id: &Id,
        ctx: &SecurityContext,
    ) -> EngineResult<()> {
        let Some(prior) = self.backend().get(class_id, id).await? else {
            return Err(EngineError::not_found(class_id, id));
        };
        if !ctx.can_access(&prior) {
            return Err(EngineError::Forbidden(format!(
                "security context does not match '{}/{}'",
                class_id, id
            )));
        }

        // system classes cannot be deleted while flagged
        if class_id == CLASS {
            let flagged = prior
                .get("is_system")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if flagged || is_system_class(&id.to_string()) {
                return Err(EngineError::Forbidden(format!(
                    "system class '{}' cannot be deleted",
                    id
                )));
            }
        }

        self.backend().delete(class_id, id).await?;

        if class_id == CLASS {
            self.registry.invalidate(&id.to_string());
        }

        Logger::info(
            "OBJECT_DELETED",
            &[("class", class_id), ("id", &id.to_string())],
        );

        self.broadcast(delete_item(&prior), ctx);
        Ok(())
    }

    /// Wipe every class's records and reseed the system classes.
    pub async fn reset(&self, ctx: &SecurityContext) -> EngineResult<()> {
        if !ctx.disable_ownership {
            return Err(EngineError::Forbidden(
                "reset requires administrative mode".into(),
            ));
        }

        let defs = self.registry.all_classes().await?;
        for def in &defs {
            for record in self.backend().get_all(&def.id).await? {
                if let Some(id) = &record.id {
                    self.backend().delete(&def.id, id).await?;
                }
            }
        }
        for def in &defs {
            self.backend()
                .delete(CLASS, &Id::Str(def.id.clone()))
                .await?;
        }

        self.registry.invalidate_all();
        self.registry.reseed().await?;
        Ok(())
    }

    fn broadcast(&self, item: Value, ctx: &SecurityContext) {
        let Some(producer) = &self.producer else {
            return;
        };
        producer.emit(ChangeBatch::changes(vec![item]), ctx.user_id.clone());
    }
}
