//! Engine error taxonomy
//!
//! Every engine failure carries one of seven codes:
//! invalid_params, not_found, forbidden, validation_failed,
//! unique, invalid_relation, storage_error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Stable error codes exposed to API consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Caller-supplied arguments are missing or malformed
    InvalidParams,
    /// Targeted record or class does not exist
    NotFound,
    /// Security-context mismatch on read or write
    Forbidden,
    /// One or more per-property errors
    ValidationFailed,
    /// Name or unique-constraint violation
    Unique,
    /// Operation invoked on a field that is not a reference relation
    InvalidRelation,
    /// Backend rejected the operation
    StorageError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParams => "invalid_params",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::Unique => "unique",
            ErrorCode::InvalidRelation => "invalid_relation",
            ErrorCode::StorageError => "storage_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single per-property validation failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Field path, e.g. "address.city" or "tags[2]"
    pub path: String,
    /// Human-readable message
    pub message: String,
    /// Machine code, e.g. "required", "type", "email"
    pub code: String,
}

impl ValidationIssue {
    pub fn new(
        path: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            code: code.into(),
        }
    }

    /// Prefix the issue path with a parent segment ("key" or "key[i]")
    pub fn nested_under(mut self, prefix: &str) -> Self {
        self.path = if self.path.is_empty() {
            prefix.to_string()
        } else {
            format!("{}.{}", prefix, self.path)
        };
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.path, self.message, self.code)
    }
}

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("'{class_id}/{id}' not found")]
    NotFound { class_id: String, id: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation failed for class '{class_id}' ({} issue(s))", issues.len())]
    ValidationFailed {
        class_id: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("name '{name}' already exists in class '{class_id}'")]
    UniqueViolation { class_id: String, name: String },

    #[error("property '{prop}' of class '{class_id}' is not a reference relation")]
    InvalidRelation { class_id: String, prop: String },

    #[error("class inheritance cycle through '{0}'")]
    InheritanceCycle(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Returns the taxonomy code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidParams(_) => ErrorCode::InvalidParams,
            EngineError::NotFound { .. } => ErrorCode::NotFound,
            EngineError::Forbidden(_) => ErrorCode::Forbidden,
            EngineError::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            EngineError::UniqueViolation { .. } => ErrorCode::Unique,
            EngineError::InvalidRelation { .. } => ErrorCode::InvalidRelation,
            EngineError::InheritanceCycle(_) => ErrorCode::InvalidParams,
            EngineError::Storage(_) => ErrorCode::StorageError,
        }
    }

    /// Per-property issues, when the failure carries them
    pub fn issues(&self) -> Option<&[ValidationIssue]> {
        match self {
            EngineError::ValidationFailed { issues, .. } => Some(issues),
            _ => None,
        }
    }

    pub fn not_found(class_id: impl Into<String>, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound {
            class_id: class_id.into(),
            id: id.to_string(),
        }
    }
}
