//! Server configuration
//!
//! A JSON config file selects the storage backend and the bind
//! addresses; a few environment variables override per deployment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {cause}")]
    Unreadable { path: String, cause: String },

    #[error("malformed config '{path}': {cause}")]
    Malformed { path: String, cause: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Backend selection, shaped like an `@storage` record
    pub storage: StorageConfig,

    /// REST bind address
    pub http_addr: String,

    /// Fan-out WebSocket bind address
    pub fanout_ws_addr: String,

    /// Fan-out HTTP bind address (broadcast + health)
    pub fanout_http_addr: String,

    /// Where the engine POSTs change batches; `None` disables the
    /// producer entirely
    pub broadcast_url: Option<String>,

    /// Synthesize a minimal class on first write to an unknown class
    pub auto_create_class: bool,

    /// Where `/export` writes its dumps
    pub exports_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            http_addr: "0.0.0.0:4000".to_string(),
            fanout_ws_addr: "0.0.0.0:4200".to_string(),
            fanout_http_addr: "0.0.0.0:4100".to_string(),
            broadcast_url: Some("http://127.0.0.1:4100/broadcast".to_string()),
            auto_create_class: false,
            exports_dir: PathBuf::from("./exports"),
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file; a missing file is the default config.
    /// Environment variables win over the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
                    path: path.display().to_string(),
                    cause: e.to_string(),
                })?;
            serde_json::from_str(&content).map_err(|e| ConfigError::Malformed {
                path: path.display().to_string(),
                cause: e.to_string(),
            })?
        } else {
            Self::default()
        };

        if let Ok(addr) = std::env::var("METASTORE_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Ok(addr) = std::env::var("METASTORE_FANOUT_WS_ADDR") {
            config.fanout_ws_addr = addr;
        }
        if let Ok(addr) = std::env::var("METASTORE_FANOUT_HTTP_ADDR") {
            config.fanout_http_addr = addr;
        }
        if let Ok(url) = std::env::var("METASTORE_BROADCAST_URL") {
            config.broadcast_url = if url.is_empty() { None } else { Some(url) };
        }

        Ok(config)
    }
}
