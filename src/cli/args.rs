//! CLI argument definitions using clap
//!
//! Commands:
//! - metastore serve   --config <path>
//! - metastore fanout  --config <path>
//! - metastore genesis --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// metastore - a schema-driven object store whose schema is data
#[derive(Parser, Debug)]
#[command(name = "metastore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the engine and its REST surface
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./metastore.json")]
        config: PathBuf,
    },

    /// Start the real-time fan-out service
    Fanout {
        /// Path to configuration file
        #[arg(long, default_value = "./metastore.json")]
        config: PathBuf,
    },

    /// Seed the system classes and verify the store, then exit
    Genesis {
        /// Path to configuration file
        #[arg(long, default_value = "./metastore.json")]
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
