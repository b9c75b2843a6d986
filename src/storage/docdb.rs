//! Document database backend (MongoDB)
//!
//! One collection per class (collection name substitutes `@` with `_`).
//! A `_counters` collection holds per-class monotonic sequences produced
//! by an atomic find-and-increment. `rename_prop` uses the native
//! `$rename` operator; `rename_class` copies documents into the new
//! collection and drops the old.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReplaceOptions, ReturnDocument};
use mongodb::{Client, Database};

use crate::core::record::{now_rfc3339, Id, Record, CREATED_AT, UPDATED_AT};

use super::errors::{StorageError, StorageResult};
use super::query::{Filter, FilterOp, QueryOptions, SortDir};
use super::StorageBackend;

const COUNTERS: &str = "_counters";

pub struct DocDbBackend {
    db: Database,
}

impl DocDbBackend {
    /// Connect to the database holding this store's collections.
    pub async fn connect(uri: &str, database: &str) -> StorageResult<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StorageError::new("connect", database, e))?;
        Ok(Self {
            db: client.database(database),
        })
    }

    /// Collection name for a class: `@` becomes `_`.
    pub fn collection_name(class_id: &str) -> String {
        class_id.replace('@', "_")
    }

    fn collection(&self, class_id: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(&Self::collection_name(class_id))
    }

    /// Atomic find-and-increment on the per-class counter.
    async fn next_sequence(&self, class_id: &str) -> StorageResult<i64> {
        let counters = self.db.collection::<Document>(COUNTERS);
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let updated = counters
            .find_one_and_update(
                doc! { "_id": class_id },
                doc! { "$inc": { "seq": 1i64 } },
                options,
            )
            .await
            .map_err(|e| StorageError::new("set", class_id, e))?;

        updated
            .as_ref()
            .and_then(|d| d.get("seq"))
            .and_then(bson_int)
            .ok_or_else(|| StorageError::new("set", class_id, "counter document missing 'seq'"))
    }

    fn to_document(class_id: &str, record: &Record) -> StorageResult<Document> {
        let mut document = bson::to_document(record)
            .map_err(|e| StorageError::new("set", class_id, e))?;
        if let Some(id) = &record.id {
            document.insert("_id", id.to_string());
        }
        Ok(document)
    }

    fn from_document(class_id: &str, mut document: Document) -> StorageResult<Record> {
        document.remove("_id");
        bson::from_document(document).map_err(|e| {
            StorageError::new("get", class_id, format!("corrupt document: {}", e))
        })
    }

    fn filter_document(class_id: &str, filters: &[Filter]) -> StorageResult<Document> {
        let mut document = Document::new();
        for filter in filters {
            let entry = match &filter.op {
                FilterOp::Eq(value) => json_bson(class_id, value)?,
                FilterOp::In(values) => {
                    let set = values
                        .iter()
                        .map(|v| json_bson(class_id, v))
                        .collect::<StorageResult<Vec<Bson>>>()?;
                    Bson::Document(doc! { "$in": set })
                }
            };
            document.insert(filter.field.clone(), entry);
        }
        Ok(document)
    }
}

fn json_bson(class_id: &str, value: &serde_json::Value) -> StorageResult<Bson> {
    bson::to_bson(value).map_err(|e| StorageError::new("query", class_id, e))
}

fn bson_int(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

#[async_trait]
impl StorageBackend for DocDbBackend {
    async fn get(&self, class_id: &str, id: &Id) -> StorageResult<Option<Record>> {
        let found = self
            .collection(class_id)
            .find_one(doc! { "_id": id.to_string() }, None)
            .await
            .map_err(|e| StorageError::new("get", class_id, e).with_id(id))?;

        found
            .map(|document| Self::from_document(class_id, document))
            .transpose()
    }

    async fn get_all(&self, class_id: &str) -> StorageResult<Vec<Record>> {
        let mut cursor = self
            .collection(class_id)
            .find(doc! {}, None)
            .await
            .map_err(|e| StorageError::new("get", class_id, e))?;

        let mut records = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| StorageError::new("get", class_id, e))?
        {
            records.push(Self::from_document(class_id, document)?);
        }
        Ok(records)
    }

    async fn set(&self, class_id: &str, mut record: Record) -> StorageResult<Record> {
        let id = match record.id.clone() {
            Some(id) => id,
            None => Id::Int(self.next_sequence(class_id).await?),
        };
        record.id = Some(id.clone());
        record.class_id = class_id.to_string();

        let existing = self.get(class_id, &id).await?;
        match existing {
            Some(prior) => {
                if !record.contains(CREATED_AT) {
                    if let Some(created) = prior.get(CREATED_AT) {
                        record.set(CREATED_AT, created.clone());
                    }
                }
            }
            None => record.stamp_created(),
        }
        record.stamp_updated();

        let document = Self::to_document(class_id, &record)?;
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection(class_id)
            .replace_one(doc! { "_id": id.to_string() }, document, options)
            .await
            .map_err(|e| StorageError::new("set", class_id, e).with_id(&id))?;

        Ok(record)
    }

    async fn delete(&self, class_id: &str, id: &Id) -> StorageResult<bool> {
        let result = self
            .collection(class_id)
            .delete_one(doc! { "_id": id.to_string() }, None)
            .await
            .map_err(|e| StorageError::new("delete", class_id, e).with_id(id))?;
        Ok(result.deleted_count == 1)
    }

    async fn query(
        &self,
        class_id: &str,
        filters: &[Filter],
        options: &QueryOptions,
    ) -> StorageResult<Vec<Record>> {
        let filter = Self::filter_document(class_id, filters)?;

        let mut find_options = FindOptions::default();
        if let Some(sort_field) = &options.sort {
            let direction: i32 = match options.sort_dir {
                SortDir::Asc => 1,
                SortDir::Desc => -1,
            };
            let mut sort = Document::new();
            sort.insert(sort_field.clone(), direction);
            find_options.sort = Some(sort);
        }
        if let Some(limit) = options.limit {
            find_options.limit = Some(limit as i64);
        }
        if options.offset > 0 {
            find_options.skip = Some(options.offset as u64);
        }

        let mut cursor = self
            .collection(class_id)
            .find(filter, find_options)
            .await
            .map_err(|e| StorageError::new("query", class_id, e))?;

        let mut records = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| StorageError::new("query", class_id, e))?
        {
            records.push(Self::from_document(class_id, document)?);
        }
        Ok(records)
    }

    async fn rename_prop(
        &self,
        class_id: &str,
        old_key: &str,
        new_key: &str,
    ) -> StorageResult<u64> {
        let mut filter = Document::new();
        filter.insert(old_key, doc! { "$exists": true });

        let mut rename = Document::new();
        rename.insert(old_key, new_key);
        let mut update = Document::new();
        update.insert("$rename", rename);
        update.insert("$set", doc! { UPDATED_AT: now_rfc3339() });

        let result = self
            .collection(class_id)
            .update_many(filter, update, None)
            .await
            .map_err(|e| StorageError::new("rename_prop", class_id, e))?;
        Ok(result.modified_count)
    }

    async fn rename_class(&self, old_class_id: &str, new_class_id: &str) -> StorageResult<u64> {
        let records = self.get_all(old_class_id).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut documents = Vec::with_capacity(records.len());
        for mut record in records {
            record.class_id = new_class_id.to_string();
            record.stamp_updated();
            documents.push(Self::to_document(new_class_id, &record)?);
        }
        let count = documents.len() as u64;

        self.collection(new_class_id)
            .insert_many(documents, None)
            .await
            .map_err(|e| StorageError::new("rename_class", new_class_id, e))?;

        self.collection(old_class_id)
            .drop(None)
            .await
            .map_err(|e| StorageError::new("rename_class", old_class_id, e))?;

        Ok(count)
    }
}
