//! Backend configuration
//!
//! The `@storage` record selects a backend: type ∈ {file, docdb,
//! httpdocdb} plus connection parameters. The factory opens the
//! matching implementation behind the trait object the engine holds.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::docdb::DocDbBackend;
use super::errors::StorageResult;
use super::file::FileBackend;
use super::httpdocdb::HttpDocDbBackend;
use super::StorageBackend;

/// Storage backend selection, shaped like the `@storage` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Flat-file JSON: one `<class>.json` per class under `path`
    File { path: PathBuf },
    /// Document database: `uri` plus the database holding the
    /// per-class collections
    Docdb { uri: String, database: String },
    /// HTTP document database: server base URL, one database per class
    Httpdocdb { base_url: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File {
            path: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    /// Open the configured backend.
    pub async fn open(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        match self {
            StorageConfig::File { path } => Ok(Arc::new(FileBackend::open(path.clone())?)),
            StorageConfig::Docdb { uri, database } => {
                Ok(Arc::new(DocDbBackend::connect(uri, database).await?))
            }
            StorageConfig::Httpdocdb { base_url } => {
                Ok(Arc::new(HttpDocDbBackend::new(base_url.clone())?))
            }
        }
    }
}
