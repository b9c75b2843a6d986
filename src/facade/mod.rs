//! Object facade
//!
//! A thin wrapper around a stored record: typed access, per-field
//! dirty tracking against a snapshot, and relation neighbours held in
//! memory. Children that become dirty notify their parents through
//! weak back-references, so one save on the root writes only the
//! changed records, children first.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::core::context::SecurityContext;
use crate::core::error::EngineResult;
use crate::core::record::{Id, Record};
use crate::engine::Engine;
use crate::relations::{RelatedMode, Relations};
use crate::schema::DataType;
use crate::storage::QueryOptions;
use crate::validation::cast_value;

struct FacadeState {
    record: Record,
    snapshot: Record,
    dirty: BTreeSet<String>,
    children_dirty: bool,
    parent: Option<Weak<Mutex<FacadeState>>>,
    neighbours: HashMap<String, Vec<ObjectFacade>>,
}

/// Facade over one record. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ObjectFacade {
    state: Arc<Mutex<FacadeState>>,
}

impl ObjectFacade {
    pub fn load(record: Record) -> Self {
        Self {
            state: Arc::new(Mutex::new(FacadeState {
                snapshot: record.clone(),
                record,
                dirty: BTreeSet::new(),
                children_dirty: false,
                parent: None,
                neighbours: HashMap::new(),
            })),
        }
    }

    pub fn id(&self) -> Option<Id> {
        self.state.lock().ok().and_then(|s| s.record.id.clone())
    }

    pub fn class_id(&self) -> String {
        self.state
            .lock()
            .map(|s| s.record.class_id.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().ok().and_then(|s| s.record.get(key).cloned())
    }

    /// Read with coercion to the requested scalar type.
    pub fn get_str(&self, key: &str) -> Option<String> {
        let value = self.get(key)?;
        cast_value(&value, DataType::String)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        cast_value(&value, DataType::Integer).ok().and_then(|v| v.as_i64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        let value = self.get(key)?;
        cast_value(&value, DataType::Boolean).ok().and_then(|v| v.as_bool())
    }

    /// Write a field and mark it dirty; parents learn a child changed.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Ok(mut state) = self.state.lock() {
            if state.record.get(&key) == Some(&value) {
                return;
            }
            state.record.set(key.clone(), value);
            state.dirty.insert(key);
        }
        self.notify_parents();
    }

    pub fn is_dirty(&self) -> bool {
        self.state
            .lock()
            .map(|s| !s.dirty.is_empty() || s.children_dirty)
            .unwrap_or(false)
    }

    pub fn dirty_fields(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.dirty.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Attach a related facade under a relation key, wiring the child's
    /// back-reference to this facade.
    pub fn attach_related(&self, key: impl Into<String>, child: ObjectFacade) {
        if let Ok(mut child_state) = child.state.lock() {
            child_state.parent = Some(Arc::downgrade(&self.state));
        }
        if let Ok(mut state) = self.state.lock() {
            state.neighbours.entry(key.into()).or_default().push(child);
        }
    }

    /// In-memory neighbours for a relation key.
    pub fn related(&self, key: &str) -> Vec<ObjectFacade> {
        self.state
            .lock()
            .map(|s| s.neighbours.get(key).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Neighbours for a relation key, falling back to a backend read
    /// when none are attached.
    pub async fn load_related(
        &self,
        engine: &Engine,
        key: &str,
        ctx: &SecurityContext,
    ) -> EngineResult<Vec<ObjectFacade>> {
        let attached = self.related(key);
        if !attached.is_empty() {
            return Ok(attached);
        }

        let record = self
            .state
            .lock()
            .map(|s| s.record.clone())
            .unwrap_or_else(|_| Record::new(""));
        let related = Relations::new(engine)
            .get_related(
                &record,
                key,
                RelatedMode::Resolve,
                &[],
                &QueryOptions::default(),
                ctx,
            )
            .await?;

        let facades: Vec<ObjectFacade> = related.into_iter().map(ObjectFacade::load).collect();
        for facade in &facades {
            self.attach_related(key, facade.clone());
        }
        Ok(facades)
    }

    /// Write the dirty graph, children first, then this record. Only
    /// changed fields are sent; clean facades write nothing.
    pub fn save<'a>(
        &'a self,
        engine: &'a Engine,
        ctx: &'a SecurityContext,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let children: Vec<ObjectFacade> = self
                .state
                .lock()
                .map(|s| s.neighbours.values().flatten().cloned().collect())
                .unwrap_or_default();
            for child in children {
                if child.is_dirty() {
                    child.save(engine, ctx).await?;
                }
            }

            let pending = self.changes();
            if let Some((class_id, input)) = pending {
                let stored = engine.set_object(&class_id, input, ctx).await?;
                if let Ok(mut state) = self.state.lock() {
                    state.record = stored.clone();
                    state.snapshot = stored;
                    state.dirty.clear();
                }
            }

            if let Ok(mut state) = self.state.lock() {
                state.children_dirty = false;
            }
            Ok(())
        })
    }

    /// The record id plus only the dirty fields, or `None` when clean.
    fn changes(&self) -> Option<(String, Record)> {
        let state = self.state.lock().ok()?;
        if state.dirty.is_empty() {
            return None;
        }
        let mut input = Record::new(state.record.class_id.clone());
        input.id = state.record.id.clone();
        for key in &state.dirty {
            if let Some(value) = state.record.get(key) {
                input.set(key.clone(), value.clone());
            } else {
                input.set(key.clone(), Value::Null);
            }
        }
        Some((state.record.class_id.clone(), input))
    }

    /// Walk the parent chain marking each as child-dirty. The graph
    /// may contain cycles; visited pointers stop the walk.
    fn notify_parents(&self) {
        let mut visited: Vec<*const Mutex<FacadeState>> = vec![Arc::as_ptr(&self.state)];
        let mut current = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.parent.as_ref().and_then(Weak::upgrade));

        while let Some(parent) = current {
            let ptr = Arc::as_ptr(&parent);
            if visited.contains(&ptr) {
                break;
            }
            visited.push(ptr);
            current = parent.lock().ok().and_then(|mut s| {
                s.children_dirty = true;
                s.parent.as_ref().and_then(Weak::upgrade)
            });
        }
    }
}
