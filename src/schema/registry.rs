//! Schema registry
//!
//! Single source of truth for class metadata. Caches merged class
//! views by id and reconstructs from storage on miss. All writes
//! route through this process, so invalidation is process-local.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::core::error::{EngineError, EngineResult};
use crate::core::record::{Id, Record};
use crate::storage::StorageBackend;

use super::bootstrap::{builtin_class, builtin_classes};
use super::types::{is_system_class, ClassDef, PropDef, CLASS, PROP};

/// Merged view of a class: own definition plus the effective property
/// set with ancestors folded in.
#[derive(Debug, Clone)]
pub struct ClassMeta {
    pub def: ClassDef,
    /// Own + ancestor props, child overrides by key, ordered by
    /// display_order then insertion
    pub effective_props: Vec<PropDef>,
    /// Parent chain, nearest first, system ancestors excluded
    pub ancestors: Vec<String>,
}

impl ClassMeta {
    pub fn prop(&self, key: &str) -> Option<&PropDef> {
        self.effective_props.iter().find(|p| p.key == key)
    }
}

pub struct SchemaRegistry {
    backend: Arc<dyn StorageBackend>,
    cache: RwLock<HashMap<String, Arc<ClassMeta>>>,
    bootstrapped: tokio::sync::Mutex<bool>,
}

impl SchemaRegistry {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
            bootstrapped: tokio::sync::Mutex::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Seed the system classes if the store has never been used.
    ///
    /// `@class` is itself an instance of `@class`; when its record is
    /// absent the full compiled-in set is written.
    pub async fn ensure_bootstrap(&self) -> EngineResult<()> {
        let mut seeded = self.bootstrapped.lock().await;
        if *seeded {
            return Ok(());
        }

        let marker = self
            .backend
            .get(CLASS, &Id::Str(CLASS.to_string()))
            .await?;
        if marker.is_none() {
            for def in builtin_classes() {
                self.backend.set(CLASS, def.to_record()).await?;
            }
        }

        *seeded = true;
        Ok(())
    }

    /// Rewrite the full compiled-in seed, regardless of current state.
    pub async fn reseed(&self) -> EngineResult<()> {
        for def in builtin_classes() {
            self.backend.set(CLASS, def.to_record()).await?;
        }
        let mut seeded = self.bootstrapped.lock().await;
        *seeded = true;
        Ok(())
    }

    /// Verify the seed: every system class resolvable from storage.
    pub async fn verify_bootstrap(&self) -> EngineResult<Vec<String>> {
        let mut missing = Vec::new();
        for def in builtin_classes() {
            let found = self.backend.get(CLASS, &Id::Str(def.id.clone())).await?;
            if found.is_none() {
                missing.push(def.id);
            }
        }
        Ok(missing)
    }

    /// Merged class view; `None` when the class does not exist.
    pub async fn get_class(&self, class_id: &str) -> EngineResult<Option<Arc<ClassMeta>>> {
        if let Some(meta) = self.cached(class_id) {
            return Ok(Some(meta));
        }

        self.ensure_bootstrap().await?;

        let Some(def) = self.load_def(class_id).await? else {
            return Ok(None);
        };

        // walk the parent chain up to but not past the first system
        // class; their props describe schema metadata, not instances
        let mut chain = vec![def.clone()];
        let mut ancestors = Vec::new();
        let mut visited: HashSet<String> = HashSet::from([def.id.clone()]);
        let mut parent_id = def.extends_id.clone();

        while let Some(pid) = parent_id {
            if !visited.insert(pid.clone()) {
                return Err(EngineError::InheritanceCycle(pid));
            }
            if is_system_class(&pid) {
                break;
            }
            let Some(parent) = self.load_def(&pid).await? else {
                break;
            };
            parent_id = parent.extends_id.clone();
            ancestors.push(pid);
            chain.push(parent);
        }

        let effective_props = merge_chain(&chain);
        let meta = Arc::new(ClassMeta {
            def,
            effective_props,
            ancestors,
        });

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(class_id.to_string(), Arc::clone(&meta));
        }
        Ok(Some(meta))
    }

    /// Effective property set of a class, or `None` when it is absent.
    pub async fn get_class_props(&self, class_id: &str) -> EngineResult<Option<Vec<PropDef>>> {
        Ok(self
            .get_class(class_id)
            .await?
            .map(|meta| meta.effective_props.clone()))
    }

    /// Drop the cached entry and every cached descendant.
    pub fn invalidate(&self, class_id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|id, meta| {
                id != class_id && !meta.ancestors.iter().any(|a| a == class_id)
            });
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Whether `class_id` equals `ancestor` or descends from it.
    pub async fn is_subclass_of(&self, class_id: &str, ancestor: &str) -> EngineResult<bool> {
        if class_id == ancestor {
            return Ok(true);
        }
        match self.get_class(class_id).await? {
            Some(meta) => Ok(meta.ancestors.iter().any(|a| a == ancestor)),
            None => Ok(false),
        }
    }

    /// Every class definition currently stored.
    pub async fn all_classes(&self) -> EngineResult<Vec<ClassDef>> {
        self.ensure_bootstrap().await?;
        let records = self.backend.get_all(CLASS).await?;
        let mut defs = Vec::with_capacity(records.len());
        for record in records {
            defs.push(ClassDef::from_record(&record)?);
        }
        Ok(defs)
    }

    /// Ids of classes equal to or descending from `ancestor`.
    pub async fn subclasses_of(&self, ancestor: &str) -> EngineResult<Vec<String>> {
        let defs = self.all_classes().await?;
        let by_id: HashMap<&str, &ClassDef> =
            defs.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut matching = Vec::new();
        for def in &defs {
            let mut current = Some(def.id.as_str());
            let mut visited = HashSet::new();
            while let Some(id) = current {
                if id == ancestor {
                    matching.push(def.id.clone());
                    break;
                }
                if !visited.insert(id) {
                    break;
                }
                current = by_id
                    .get(id)
                    .and_then(|d| d.extends_id.as_deref());
            }
        }
        Ok(matching)
    }

    fn cached(&self, class_id: &str) -> Option<Arc<ClassMeta>> {
        self.cache
            .read()
            .ok()
            .and_then(|cache| cache.get(class_id).cloned())
    }

    /// Own definition of a class: stored record unified with any
    /// independently persisted `@prop` records, falling back to the
    /// compiled-in table for system classes.
    async fn load_def(&self, class_id: &str) -> EngineResult<Option<ClassDef>> {
        let stored = self
            .backend
            .get(CLASS, &Id::Str(class_id.to_string()))
            .await?;

        let Some(record) = stored else {
            return Ok(builtin_class(class_id));
        };

        let mut def = ClassDef::from_record(&record)?;
        self.merge_independent_props(&mut def).await?;
        Ok(Some(def))
    }

    /// Props may be persisted as independent `@prop` records keyed
    /// `<class_id>.<key>`; embedded entries win on key collision.
    async fn merge_independent_props(&self, def: &mut ClassDef) -> EngineResult<()> {
        let prefix = format!("{}.", def.id);
        let prop_records = self.backend.get_all(PROP).await?;

        for record in prop_records {
            let Some(id) = record.id_string() else { continue };
            if !id.starts_with(&prefix) {
                continue;
            }
            let prop = parse_prop_record(&record)?;
            if def.props.iter().all(|p| p.key != prop.key) {
                def.props.push(prop);
            }
        }
        Ok(())
    }
}

fn parse_prop_record(record: &Record) -> EngineResult<PropDef> {
    let mut value = record.to_value();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("class_id");
        // default the key from the record id's `<class>.<key>` suffix
        if !obj.contains_key("key") {
            if let Some(id) = obj.get("id").and_then(Value::as_str) {
                if let Some((_, key)) = id.split_once('.') {
                    let key = key.to_string();
                    obj.insert("key".into(), Value::from(key));
                }
            }
        }
    }
    serde_json::from_value(value)
        .map_err(|e| EngineError::InvalidParams(format!("malformed prop record: {}", e)))
}

/// Merge a chain (self first, ancestors after) into the effective
/// property list: ancestors first, child overrides by key in place,
/// then a stable sort by display_order with unordered props last.
fn merge_chain(chain: &[ClassDef]) -> Vec<PropDef> {
    let mut merged: Vec<PropDef> = Vec::new();

    for def in chain.iter().rev() {
        for prop in &def.props {
            match merged.iter_mut().find(|p| p.key == prop.key) {
                Some(existing) => *existing = prop.clone(),
                None => merged.push(prop.clone()),
            }
        }
    }

    merged.sort_by_key(|p| p.display_order.unwrap_or(i64::MAX));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::DataType;
    use crate::storage::FileBackend;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SchemaRegistry) {
        let tmp = TempDir::new().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FileBackend::open(tmp.path()).unwrap());
        (tmp, SchemaRegistry::new(backend))
    }

    #[tokio::test]
    async fn test_bootstrap_makes_class_reflective() {
        let (_tmp, registry) = setup().await;

        let meta = registry.get_class(CLASS).await.unwrap().unwrap();
        assert_eq!(meta.def.id, CLASS);
        for key in ["name", "extends_id", "props"] {
            assert!(meta.prop(key).is_some(), "missing '{}'", key);
        }

        // and the record is actually persisted
        let record = registry
            .backend()
            .get(CLASS, &Id::Str(CLASS.into()))
            .await
            .unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_unknown_class_resolves_to_none() {
        let (_tmp, registry) = setup().await;
        assert!(registry.get_class("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parent_chain_merging_with_override() {
        let (_tmp, registry) = setup().await;
        registry.ensure_bootstrap().await.unwrap();

        let base = ClassDef::new("animal", "Animal").with_props(vec![
            PropDef::string("name").required().order(1),
            PropDef::string("sound").order(2),
        ]);
        let dog = ClassDef::new("dog", "Dog")
            .extending("animal")
            .with_props(vec![
                // override: sound becomes required on the child
                PropDef::string("sound").required().order(2),
                PropDef::boolean("good_boy").order(3),
            ]);

        registry.backend().set(CLASS, base.to_record()).await.unwrap();
        registry.backend().set(CLASS, dog.to_record()).await.unwrap();

        let props = registry.get_class_props("dog").await.unwrap().unwrap();
        let keys: Vec<_> = props.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["name", "sound", "good_boy"]);
        assert!(props.iter().find(|p| p.key == "sound").unwrap().required);

        let meta = registry.get_class("dog").await.unwrap().unwrap();
        assert_eq!(meta.ancestors, vec!["animal".to_string()]);
    }

    #[tokio::test]
    async fn test_merge_stops_at_system_class() {
        let (_tmp, registry) = setup().await;
        registry.ensure_bootstrap().await.unwrap();

        let widget = ClassDef::new("widget", "Widget")
            .extending(CLASS)
            .with_props(vec![PropDef::string("label")]);
        registry.backend().set(CLASS, widget.to_record()).await.unwrap();

        let props = registry.get_class_props("widget").await.unwrap().unwrap();
        let keys: Vec<_> = props.iter().map(|p| p.key.as_str()).collect();
        // @class's own props (name, props, ...) must not leak in
        assert_eq!(keys, vec!["label"]);
    }

    #[tokio::test]
    async fn test_inheritance_cycle_detected() {
        let (_tmp, registry) = setup().await;
        registry.ensure_bootstrap().await.unwrap();

        let a = ClassDef::new("a", "A").extending("b");
        let b = ClassDef::new("b", "B").extending("a");
        registry.backend().set(CLASS, a.to_record()).await.unwrap();
        registry.backend().set(CLASS, b.to_record()).await.unwrap();

        let err = registry.get_class("a").await.unwrap_err();
        assert!(matches!(err, EngineError::InheritanceCycle(_)));
    }

    #[tokio::test]
    async fn test_display_order_sorts_effective_props() {
        let (_tmp, registry) = setup().await;
        registry.ensure_bootstrap().await.unwrap();

        let def = ClassDef::new("doc", "Doc").with_props(vec![
            PropDef::string("third").order(30),
            PropDef::string("first").order(10),
            PropDef::string("unordered"),
            PropDef::string("second").order(20),
        ]);
        registry.backend().set(CLASS, def.to_record()).await.unwrap();

        let props = registry.get_class_props("doc").await.unwrap().unwrap();
        let keys: Vec<_> = props.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["first", "second", "third", "unordered"]);
    }

    #[tokio::test]
    async fn test_independent_prop_records_are_unified() {
        let (_tmp, registry) = setup().await;
        registry.ensure_bootstrap().await.unwrap();

        let def = ClassDef::new("note", "Note")
            .with_props(vec![PropDef::string("title").order(1)]);
        registry.backend().set(CLASS, def.to_record()).await.unwrap();

        // an independently persisted prop, keyed `<class>.<key>`
        let record = Record::from_value(json!({
            "id": "note.body",
            "class_id": "@prop",
            "key": "body",
            "data_type": "string",
            "display_order": 2
        }))
        .unwrap();
        registry.backend().set(PROP, record).await.unwrap();

        let meta = registry.get_class("note").await.unwrap().unwrap();
        let keys: Vec<_> = meta.effective_props.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["title", "body"]);
        assert_eq!(meta.prop("body").unwrap().data_type, DataType::String);
    }

    #[tokio::test]
    async fn test_invalidate_drops_descendants_too() {
        let (_tmp, registry) = setup().await;
        registry.ensure_bootstrap().await.unwrap();

        let base = ClassDef::new("animal", "Animal")
            .with_props(vec![PropDef::string("name")]);
        let dog = ClassDef::new("dog", "Dog").extending("animal");
        registry.backend().set(CLASS, base.to_record()).await.unwrap();
        registry.backend().set(CLASS, dog.to_record()).await.unwrap();

        registry.get_class("dog").await.unwrap().unwrap();

        // grow the parent, invalidate it, child view must refresh
        let base = ClassDef::new("animal", "Animal").with_props(vec![
            PropDef::string("name"),
            PropDef::integer("legs"),
        ]);
        registry.backend().set(CLASS, base.to_record()).await.unwrap();
        registry.invalidate("animal");

        let props = registry.get_class_props("dog").await.unwrap().unwrap();
        assert!(props.iter().any(|p| p.key == "legs"));
    }
}
