//! Command-line interface.

pub mod args;
pub mod commands;
pub mod errors;

pub use args::{Cli, Command};
pub use commands::run_command;
pub use errors::CliError;
