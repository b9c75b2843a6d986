//! HTTP document database backend (CouchDB-compatible)
//!
//! One database per class; documents carry a `_rev` revision token for
//! optimistic concurrency and every write includes the prior revision.
//! Queries go through the server's `_find` endpoint when possible, with
//! a client-side fallback when the server rejects (e.g. missing index).
//! Counter updates retry on conflict with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::record::{Id, Record, CREATED_AT};

use super::errors::{StorageError, StorageResult};
use super::query::{apply_query, Filter, FilterOp, QueryOptions, SortDir};
use super::StorageBackend;

const COUNTERS_DB: &str = "_counters";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONFLICT_ATTEMPTS: u32 = 5;
const CONFLICT_BASE_DELAY: Duration = Duration::from_millis(50);

pub struct HttpDocDbBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDocDbBackend {
    /// Point the backend at a CouchDB-compatible server, credentials in
    /// the URL if the deployment needs them.
    pub fn new(base_url: impl Into<String>) -> StorageResult<Self> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StorageError::new("connect", &base_url, e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Database name for a class: `@` becomes `_`, lowercased to fit
    /// the server's naming rules.
    pub fn database_name(class_id: &str) -> String {
        class_id.replace('@', "_").to_lowercase()
    }

    fn db_url(&self, class_id: &str) -> String {
        format!("{}/{}", self.base_url, Self::database_name(class_id))
    }

    fn doc_url(&self, class_id: &str, id: &str) -> String {
        format!("{}/{}", self.db_url(class_id), id)
    }

    async fn ensure_database(&self, class_id: &str) -> StorageResult<()> {
        let response = self
            .client
            .put(self.db_url(class_id))
            .send()
            .await
            .map_err(|e| StorageError::new("set", class_id, e))?;

        // 201 created, 412 already exists
        if response.status().is_success() || response.status().as_u16() == 412 {
            Ok(())
        } else {
            Err(StorageError::new(
                "set",
                class_id,
                format!("database create returned {}", response.status()),
            ))
        }
    }

    /// Fetch a raw document including its `_rev`. 404 is `None`.
    async fn fetch_doc(&self, class_id: &str, id: &str) -> StorageResult<Option<Value>> {
        let response = self
            .client
            .get(self.doc_url(class_id, id))
            .send()
            .await
            .map_err(|e| StorageError::new("get", class_id, e).with_id(id))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StorageError::new(
                "get",
                class_id,
                format!("document read returned {}", response.status()),
            )
            .with_id(id));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| StorageError::new("get", class_id, e).with_id(id))?;
        Ok(Some(body))
    }

    /// PUT a document body; returns true on success, false on 409.
    async fn put_doc(&self, class_id: &str, id: &str, body: &Value) -> StorageResult<bool> {
        let response = self
            .client
            .put(self.doc_url(class_id, id))
            .json(body)
            .send()
            .await
            .map_err(|e| StorageError::new("set", class_id, e).with_id(id))?;

        if response.status().as_u16() == 409 {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(StorageError::new(
                "set",
                class_id,
                format!("document write returned {}", response.status()),
            )
            .with_id(id));
        }
        Ok(true)
    }

    /// Per-class monotonic sequence with retry-on-conflict backoff.
    async fn next_sequence(&self, class_id: &str) -> StorageResult<i64> {
        self.ensure_counters_db().await?;

        let mut delay = CONFLICT_BASE_DELAY;
        for attempt in 0..CONFLICT_ATTEMPTS {
            let current = self.fetch_counter_doc(class_id).await?;
            let (seq, rev) = match &current {
                Some(doc) => (
                    doc.get("seq").and_then(Value::as_i64).unwrap_or(0),
                    doc.get("_rev").and_then(Value::as_str).map(String::from),
                ),
                None => (0, None),
            };

            let next = seq + 1;
            let mut body = json!({ "_id": class_id, "seq": next });
            if let Some(rev) = rev {
                body["_rev"] = json!(rev);
            }

            let url = format!("{}/{}/{}", self.base_url, COUNTERS_DB, class_id);
            let response = self
                .client
                .put(url)
                .json(&body)
                .send()
                .await
                .map_err(|e| StorageError::new("set", class_id, e))?;

            if response.status().is_success() {
                return Ok(next);
            }
            if response.status().as_u16() != 409 {
                return Err(StorageError::new(
                    "set",
                    class_id,
                    format!("counter write returned {}", response.status()),
                ));
            }

            if attempt + 1 < CONFLICT_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(StorageError::new(
            "set",
            class_id,
            "counter conflict persisted after retries",
        ))
    }

    async fn ensure_counters_db(&self) -> StorageResult<()> {
        let response = self
            .client
            .put(format!("{}/{}", self.base_url, COUNTERS_DB))
            .send()
            .await
            .map_err(|e| StorageError::new("set", COUNTERS_DB, e))?;
        if response.status().is_success() || response.status().as_u16() == 412 {
            Ok(())
        } else {
            Err(StorageError::new(
                "set",
                COUNTERS_DB,
                format!("database create returned {}", response.status()),
            ))
        }
    }

    async fn fetch_counter_doc(&self, class_id: &str) -> StorageResult<Option<Value>> {
        let url = format!("{}/{}/{}", self.base_url, COUNTERS_DB, class_id);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::new("set", class_id, e))?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StorageError::new(
                "set",
                class_id,
                format!("counter read returned {}", response.status()),
            ));
        }
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| StorageError::new("set", class_id, e))?;
        Ok(Some(body))
    }

    /// All raw documents of a class, `_rev` included. Missing database
    /// is an empty class.
    async fn all_docs(&self, class_id: &str) -> StorageResult<Vec<Value>> {
        let url = format!("{}/_all_docs?include_docs=true", self.db_url(class_id));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::new("get", class_id, e))?;

        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(StorageError::new(
                "get",
                class_id,
                format!("list returned {}", response.status()),
            ));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| StorageError::new("get", class_id, e))?;

        let rows = body
            .get("rows")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("doc").cloned())
            // design documents are not records
            .filter(|doc| {
                doc.get("_id")
                    .and_then(Value::as_str)
                    .map_or(true, |id| !id.starts_with("_design/"))
            })
            .collect())
    }

    fn doc_to_record(class_id: &str, mut doc: Value) -> StorageResult<Record> {
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("_id");
            obj.remove("_rev");
        }
        Record::from_value(doc)
            .map_err(|e| StorageError::new("get", class_id, format!("corrupt document: {}", e)))
    }

    fn record_to_doc(record: &Record, id: &str, rev: Option<&str>) -> Value {
        let mut doc = record.to_value();
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("_id".into(), json!(id));
            if let Some(rev) = rev {
                obj.insert("_rev".into(), json!(rev));
            }
        }
        doc
    }

    /// Mango selector for the contract's filter set.
    fn selector(filters: &[Filter]) -> Value {
        let mut selector = Map::new();
        for filter in filters {
            let clause = match &filter.op {
                FilterOp::Eq(value) => json!({ "$eq": value }),
                FilterOp::In(values) => json!({ "$in": values }),
            };
            selector.insert(filter.field.clone(), clause);
        }
        Value::Object(selector)
    }

    fn find_body(filters: &[Filter], options: &QueryOptions) -> Value {
        let mut body = json!({ "selector": Self::selector(filters) });
        if let Some(sort_field) = &options.sort {
            let dir = match options.sort_dir {
                SortDir::Asc => "asc",
                SortDir::Desc => "desc",
            };
            body["sort"] = json!([{ sort_field.clone(): dir }]);
        }
        if let Some(limit) = options.limit {
            body["limit"] = json!(limit);
        }
        if options.offset > 0 {
            body["skip"] = json!(options.offset);
        }
        body
    }
}

#[async_trait]
impl StorageBackend for HttpDocDbBackend {
    async fn get(&self, class_id: &str, id: &Id) -> StorageResult<Option<Record>> {
        let doc = self.fetch_doc(class_id, &id.to_string()).await?;
        doc.map(|doc| Self::doc_to_record(class_id, doc)).transpose()
    }

    async fn get_all(&self, class_id: &str) -> StorageResult<Vec<Record>> {
        let docs = self.all_docs(class_id).await?;
        docs.into_iter()
            .map(|doc| Self::doc_to_record(class_id, doc))
            .collect()
    }

    async fn set(&self, class_id: &str, mut record: Record) -> StorageResult<Record> {
        self.ensure_database(class_id).await?;

        let id = match record.id.clone() {
            Some(id) => id,
            None => Id::Int(self.next_sequence(class_id).await?),
        };
        record.id = Some(id.clone());
        record.class_id = class_id.to_string();
        let key = id.to_string();

        // last-writer-wins over the revision token, refetching on conflict
        let mut delay = CONFLICT_BASE_DELAY;
        for attempt in 0..CONFLICT_ATTEMPTS {
            let existing = self.fetch_doc(class_id, &key).await?;
            let rev = existing
                .as_ref()
                .and_then(|d| d.get("_rev"))
                .and_then(Value::as_str)
                .map(String::from);

            let mut attempt_record = record.clone();
            match &existing {
                Some(prior) => {
                    if !attempt_record.contains(CREATED_AT) {
                        if let Some(created) = prior.get(CREATED_AT) {
                            attempt_record.set(CREATED_AT, created.clone());
                        }
                    }
                }
                None => attempt_record.stamp_created(),
            }
            attempt_record.stamp_updated();

            let body = Self::record_to_doc(&attempt_record, &key, rev.as_deref());
            if self.put_doc(class_id, &key, &body).await? {
                return Ok(attempt_record);
            }

            if attempt + 1 < CONFLICT_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(StorageError::new(
            "set",
            class_id,
            "revision conflict persisted after retries",
        )
        .with_id(&key))
    }

    async fn delete(&self, class_id: &str, id: &Id) -> StorageResult<bool> {
        let key = id.to_string();
        let Some(doc) = self.fetch_doc(class_id, &key).await? else {
            return Ok(false);
        };
        let Some(rev) = doc.get("_rev").and_then(Value::as_str) else {
            return Ok(false);
        };

        let url = format!("{}?rev={}", self.doc_url(class_id, &key), rev);
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| StorageError::new("delete", class_id, e).with_id(&key))?;

        if response.status().as_u16() == 404 {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(StorageError::new(
                "delete",
                class_id,
                format!("document delete returned {}", response.status()),
            )
            .with_id(&key));
        }
        Ok(true)
    }

    async fn query(
        &self,
        class_id: &str,
        filters: &[Filter],
        options: &QueryOptions,
    ) -> StorageResult<Vec<Record>> {
        let url = format!("{}/_find", self.db_url(class_id));
        let body = Self::find_body(filters, options);

        let response = self.client.post(url).json(&body).send().await;

        // server-side query when the server accepts it
        if let Ok(response) = response {
            if response.status().is_success() {
                if let Ok(found) = response.json::<Value>().await {
                    if let Some(docs) = found.get("docs").and_then(Value::as_array) {
                        return docs
                            .iter()
                            .map(|doc| Self::doc_to_record(class_id, doc.clone()))
                            .collect();
                    }
                }
            }
        }

        // client-side fallback, e.g. sort without a matching index
        let records = self.get_all(class_id).await?;
        Ok(apply_query(records, filters, options))
    }

    async fn rename_prop(
        &self,
        class_id: &str,
        old_key: &str,
        new_key: &str,
    ) -> StorageResult<u64> {
        let docs = self.all_docs(class_id).await?;
        let mut count = 0u64;

        for doc in docs {
            let Some(obj) = doc.as_object() else { continue };
            if !obj.contains_key(old_key) {
                continue;
            }
            let id = obj
                .get("_id")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| StorageError::new("rename_prop", class_id, "document missing _id"))?;
            let rev = obj.get("_rev").and_then(Value::as_str).map(String::from);

            let mut record = Self::doc_to_record(class_id, doc)?;
            if let Some(value) = record.remove(old_key) {
                record.set(new_key.to_string(), value);
                record.stamp_updated();
            }

            let body = Self::record_to_doc(&record, &id, rev.as_deref());
            if !self.put_doc(class_id, &id, &body).await? {
                return Err(StorageError::new(
                    "rename_prop",
                    class_id,
                    "revision conflict during rewrite",
                )
                .with_id(&id));
            }
            count += 1;
        }
        Ok(count)
    }

    async fn rename_class(&self, old_class_id: &str, new_class_id: &str) -> StorageResult<u64> {
        let docs = self.all_docs(old_class_id).await?;
        if docs.is_empty() {
            return Ok(0);
        }

        self.ensure_database(new_class_id).await?;
        let mut count = 0u64;

        for doc in docs {
            let id = doc
                .get("_id")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| {
                    StorageError::new("rename_class", old_class_id, "document missing _id")
                })?;

            let mut record = Self::doc_to_record(old_class_id, doc)?;
            record.class_id = new_class_id.to_string();
            record.stamp_updated();

            // pick up the target revision when the id already exists there
            let target_rev = self
                .fetch_doc(new_class_id, &id)
                .await?
                .as_ref()
                .and_then(|d| d.get("_rev"))
                .and_then(Value::as_str)
                .map(String::from);

            let body = Self::record_to_doc(&record, &id, target_rev.as_deref());
            if !self.put_doc(new_class_id, &id, &body).await? {
                return Err(StorageError::new(
                    "rename_class",
                    new_class_id,
                    "revision conflict during move",
                )
                .with_id(&id));
            }
            count += 1;
        }

        // drop the old home
        let response = self
            .client
            .delete(self.db_url(old_class_id))
            .send()
            .await
            .map_err(|e| StorageError::new("rename_class", old_class_id, e))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(StorageError::new(
                "rename_class",
                old_class_id,
                format!("database delete returned {}", response.status()),
            ));
        }

        Ok(count)
    }
}
