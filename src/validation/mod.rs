//! Validation, casting, and the build/merge pipeline.

pub mod builder;
pub mod cast;
pub mod rules;

pub use builder::ObjectBuilder;
pub use cast::cast_value;
pub use rules::run_rule;
