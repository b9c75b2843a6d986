//! CLI error type

use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::core::error::EngineError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Stable code string for the process-exit error line
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Config(_) => "config_error",
            CliError::Engine(e) => e.code().as_str(),
            CliError::Bus(_) => "bus_error",
            CliError::Io(_) => "io_error",
        }
    }
}
