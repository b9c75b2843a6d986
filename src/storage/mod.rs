//! Storage abstraction
//!
//! A backend implements per-class CRUD, query, and the two rename
//! operations. Three implementations: flat-file JSON, document DB,
//! HTTP document DB. All preserve the contract byte-faithfully and
//! differ only in durability, concurrency, and rename atomicity.

pub mod config;
pub mod docdb;
pub mod errors;
pub mod file;
pub mod httpdocdb;
pub mod query;

pub use config::StorageConfig;
pub use docdb::DocDbBackend;
pub use errors::{StorageError, StorageResult};
pub use file::FileBackend;
pub use httpdocdb::HttpDocDbBackend;
pub use query::{apply_query, Filter, FilterOp, QueryOptions, SortDir};

use async_trait::async_trait;

use crate::core::record::{Id, Record};

/// Per-class storage contract
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// By-id lookup. Read-not-found is not an error.
    async fn get(&self, class_id: &str, id: &Id) -> StorageResult<Option<Record>>;

    /// Full list of a class. A class with no records is an empty list.
    async fn get_all(&self, class_id: &str) -> StorageResult<Vec<Record>>;

    /// Create or replace. Allocates `id` when absent, stamps
    /// `created_at` on create and `updated_at` always, returns the
    /// stored record.
    async fn set(&self, class_id: &str, record: Record) -> StorageResult<Record>;

    /// Remove by id; returns whether the record existed.
    async fn delete(&self, class_id: &str, id: &Id) -> StorageResult<bool>;

    /// Equality/IN filters with optional sort and pagination.
    async fn query(
        &self,
        class_id: &str,
        filters: &[Filter],
        options: &QueryOptions,
    ) -> StorageResult<Vec<Record>>;

    /// Rewrite a property key across every record of a class,
    /// preserving values and updating `updated_at`. Returns the count
    /// of rewritten records.
    async fn rename_prop(
        &self,
        class_id: &str,
        old_key: &str,
        new_key: &str,
    ) -> StorageResult<u64>;

    /// Move every record of a class to a new home keyed by the new
    /// class id, rewriting the `class_id` field and deleting the old
    /// home. Returns the number moved.
    async fn rename_class(&self, old_class_id: &str, new_class_id: &str) -> StorageResult<u64>;
}
