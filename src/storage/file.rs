//! Flat-file JSON backend
//!
//! One file per class, `<data_dir>/<class>.json`, content is a mapping
//! from string id to record, pretty-printed. Auto-id is
//! max(existing integer ids) + 1. Not safe under concurrent writer
//! processes; a per-backend lock serializes mutation within one.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::core::record::{Id, Record};

use super::errors::{StorageError, StorageResult};
use super::query::{apply_query, Filter, QueryOptions};
use super::StorageBackend;

pub struct FileBackend {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Open a file backend rooted at `data_dir`, creating it if needed.
    pub fn open(data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .map_err(|e| StorageError::new("open", data_dir.display().to_string(), e))?;
        Ok(Self {
            data_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn class_path(&self, class_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", class_id))
    }

    /// Load a class file into an id-keyed map. Missing file is empty.
    fn load(&self, class_id: &str) -> StorageResult<BTreeMap<String, Record>> {
        let path = self.class_path(class_id);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| StorageError::new("get", class_id, e))?;
        let raw: BTreeMap<String, Value> = serde_json::from_str(&content)
            .map_err(|e| StorageError::new("get", class_id, format!("corrupt class file: {}", e)))?;

        let mut records = BTreeMap::new();
        for (key, value) in raw {
            let record = Record::from_value(value).map_err(|e| {
                StorageError::new("get", class_id, format!("corrupt record '{}': {}", key, e))
            })?;
            records.insert(key, record);
        }
        Ok(records)
    }

    fn store(&self, class_id: &str, records: &BTreeMap<String, Record>) -> StorageResult<()> {
        let map: BTreeMap<&String, Value> = records
            .iter()
            .map(|(key, record)| (key, record.to_value()))
            .collect();
        let content = serde_json::to_string_pretty(&map)
            .map_err(|e| StorageError::new("set", class_id, e))?;
        fs::write(self.class_path(class_id), content)
            .map_err(|e| StorageError::new("set", class_id, e))
    }

    fn remove_class_file(&self, class_id: &str) -> StorageResult<()> {
        let path = self.class_path(class_id);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| StorageError::new("rename_class", class_id, e))?;
        }
        Ok(())
    }

    /// Next integer id: max(existing) + 1, starting at 1.
    fn next_id(records: &BTreeMap<String, Record>) -> i64 {
        records
            .values()
            .filter_map(|r| r.id.as_ref().and_then(Id::as_int))
            .max()
            .unwrap_or(0)
            + 1
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, class_id: &str, id: &Id) -> StorageResult<Option<Record>> {
        let records = self.load(class_id)?;
        Ok(records.get(&id.to_string()).cloned())
    }

    async fn get_all(&self, class_id: &str) -> StorageResult<Vec<Record>> {
        let records = self.load(class_id)?;
        Ok(records.into_values().collect())
    }

    async fn set(&self, class_id: &str, mut record: Record) -> StorageResult<Record> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.load(class_id)?;

        let id = match record.id.clone() {
            Some(id) => id,
            None => Id::Int(Self::next_id(&records)),
        };
        record.id = Some(id.clone());
        record.class_id = class_id.to_string();

        let key = id.to_string();
        match records.get(&key) {
            Some(existing) => {
                // carry the original creation stamp through replaces
                if !record.contains(crate::core::record::CREATED_AT) {
                    if let Some(created) = existing.get(crate::core::record::CREATED_AT) {
                        record.set(crate::core::record::CREATED_AT, created.clone());
                    }
                }
            }
            None => record.stamp_created(),
        }
        record.stamp_updated();

        records.insert(key, record.clone());
        self.store(class_id, &records)?;
        Ok(record)
    }

    async fn delete(&self, class_id: &str, id: &Id) -> StorageResult<bool> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.load(class_id)?;
        let existed = records.remove(&id.to_string()).is_some();
        if existed {
            self.store(class_id, &records)?;
        }
        Ok(existed)
    }

    async fn query(
        &self,
        class_id: &str,
        filters: &[Filter],
        options: &QueryOptions,
    ) -> StorageResult<Vec<Record>> {
        let records = self.load(class_id)?;
        Ok(apply_query(records.into_values().collect(), filters, options))
    }

    async fn rename_prop(
        &self,
        class_id: &str,
        old_key: &str,
        new_key: &str,
    ) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.load(class_id)?;
        let mut count = 0u64;
        for record in records.values_mut() {
            if let Some(value) = record.remove(old_key) {
                record.set(new_key.to_string(), value);
                record.stamp_updated();
                count += 1;
            }
        }
        if count > 0 {
            self.store(class_id, &records)?;
        }
        Ok(count)
    }

    async fn rename_class(&self, old_class_id: &str, new_class_id: &str) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;

        let old_records = self.load(old_class_id)?;
        if old_records.is_empty() {
            self.remove_class_file(old_class_id)?;
            return Ok(0);
        }

        // merge into any records already living under the new id
        let mut target = self.load(new_class_id)?;
        let mut count = 0u64;
        for (key, mut record) in old_records {
            record.class_id = new_class_id.to_string();
            record.stamp_updated();
            target.insert(key, record);
            count += 1;
        }

        self.store(new_class_id, &target)?;
        self.remove_class_file(old_class_id)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileBackend) {
        let tmp = TempDir::new().unwrap();
        let backend = FileBackend::open(tmp.path()).unwrap();
        (tmp, backend)
    }

    #[tokio::test]
    async fn test_set_allocates_sequential_ids() {
        let (_tmp, backend) = setup();

        let a = backend.set("user", Record::new("user")).await.unwrap();
        let b = backend.set("user", Record::new("user")).await.unwrap();

        assert_eq!(a.id, Some(Id::Int(1)));
        assert_eq!(b.id, Some(Id::Int(2)));
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let (_tmp, backend) = setup();

        let record = Record::new("user").with_field("name", json!("Alice"));
        let stored = backend.set("user", record).await.unwrap();
        let id = stored.id.clone().unwrap();

        let fetched = backend.get("user", &id).await.unwrap().unwrap();
        assert_eq!(fetched, stored);
        assert!(fetched.get("created_at").is_some());
        assert!(fetched.get("updated_at").is_some());
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_tmp, backend) = setup();
        let found = backend.get("user", &Id::Int(99)).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_replace_preserves_created_at() {
        let (_tmp, backend) = setup();

        let stored = backend.set("user", Record::new("user")).await.unwrap();
        let created = stored.get("created_at").cloned().unwrap();
        let id = stored.id.clone().unwrap();

        let replacement = Record::new("user")
            .with_id(id.clone())
            .with_field("name", json!("Bob"));
        let replaced = backend.set("user", replacement).await.unwrap();

        assert_eq!(replaced.get("created_at"), Some(&created));
        assert_eq!(replaced.get("name"), Some(&json!("Bob")));
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let (_tmp, backend) = setup();

        let stored = backend.set("user", Record::new("user")).await.unwrap();
        let id = stored.id.clone().unwrap();

        assert!(backend.delete("user", &id).await.unwrap());
        assert!(!backend.delete("user", &id).await.unwrap());
        assert!(backend.get("user", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_id_is_max_plus_one() {
        let (_tmp, backend) = setup();

        let a = backend.set("user", Record::new("user")).await.unwrap();
        backend.set("user", Record::new("user")).await.unwrap();
        backend.delete("user", a.id.as_ref().unwrap()).await.unwrap();

        // id 2 is still the max after deleting id 1
        let c = backend.set("user", Record::new("user")).await.unwrap();
        assert_eq!(c.id, Some(Id::Int(3)));
    }

    #[tokio::test]
    async fn test_query_with_filter_and_sort() {
        let (_tmp, backend) = setup();

        for (name, age) in [("Alice", 30), ("Bob", 25), ("Cara", 35)] {
            let record = Record::new("user")
                .with_field("name", json!(name))
                .with_field("age", json!(age));
            backend.set("user", record).await.unwrap();
        }

        let filters = vec![Filter::in_list(
            "name",
            vec![json!("Alice"), json!("Cara")],
        )];
        let options = QueryOptions::sorted_by("age", crate::storage::SortDir::Desc);

        let result = backend.query("user", &filters, &options).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].get("name"), Some(&json!("Cara")));
        assert_eq!(result[1].get("name"), Some(&json!("Alice")));
    }

    #[tokio::test]
    async fn test_rename_prop_rewrites_all_records() {
        let (_tmp, backend) = setup();

        for i in 0..3 {
            let record = Record::new("user").with_field("email", json!(format!("u{}@x", i)));
            backend.set("user", record).await.unwrap();
        }
        // one record without the key
        backend.set("user", Record::new("user")).await.unwrap();

        let count = backend.rename_prop("user", "email", "email_address").await.unwrap();
        assert_eq!(count, 3);

        for record in backend.get_all("user").await.unwrap() {
            assert!(!record.contains("email"));
        }
    }

    #[tokio::test]
    async fn test_rename_prop_roundtrip_is_identity() {
        let (_tmp, backend) = setup();

        let record = Record::new("user").with_field("email", json!("a@b"));
        let stored = backend.set("user", record).await.unwrap();

        backend.rename_prop("user", "email", "mail").await.unwrap();
        backend.rename_prop("user", "mail", "email").await.unwrap();

        let fetched = backend
            .get("user", stored.id.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.get("email"), Some(&json!("a@b")));
    }

    #[tokio::test]
    async fn test_rename_class_moves_records() {
        let (_tmp, backend) = setup();

        let a = backend.set("user", Record::new("user")).await.unwrap();
        let b = backend.set("user", Record::new("user")).await.unwrap();

        let count = backend.rename_class("user", "person").await.unwrap();
        assert_eq!(count, 2);

        for id in [a.id.unwrap(), b.id.unwrap()] {
            assert!(backend.get("user", &id).await.unwrap().is_none());
            let moved = backend.get("person", &id).await.unwrap().unwrap();
            assert_eq!(moved.class_id, "person");
        }
    }

    #[tokio::test]
    async fn test_file_layout() {
        let (tmp, backend) = setup();
        backend.set("user", Record::new("user")).await.unwrap();
        assert!(tmp.path().join("user.json").exists());
    }
}
