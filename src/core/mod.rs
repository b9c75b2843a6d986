//! Core abstractions: record model, security context, error taxonomy.

pub mod context;
pub mod error;
pub mod record;

pub use context::SecurityContext;
pub use error::{EngineError, EngineResult, ErrorCode, ValidationIssue};
pub use record::{Id, Record};
