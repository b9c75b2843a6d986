//! Storage error type
//!
//! Any backend-level failure surfaces as a typed error carrying
//! {operation, class, id, cause}. Read-not-found is not an error.

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A backend failure with full context
#[derive(Debug, Clone, Error)]
#[error("storage '{operation}' failed for class '{class_id}': {cause}")]
pub struct StorageError {
    /// The contract operation that failed (get, set, delete, query, ...)
    pub operation: &'static str,
    /// Class the operation targeted
    pub class_id: String,
    /// Record id, when the operation targeted one
    pub id: Option<String>,
    /// Backend-specific cause
    pub cause: String,
}

impl StorageError {
    pub fn new(
        operation: &'static str,
        class_id: impl Into<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self {
            operation,
            class_id: class_id.into(),
            id: None,
            cause: cause.to_string(),
        }
    }

    pub fn with_id(mut self, id: impl std::fmt::Display) -> Self {
        self.id = Some(id.to_string());
        self
    }
}
