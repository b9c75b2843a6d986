//! metastore CLI entry point
//!
//! Parses args, dispatches to the CLI commands, and turns any failure
//! into one JSON error line and a non-zero exit.

use std::process;

use metastore::cli::{run_command, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = run_command(cli.command).await {
        let error_json = serde_json::json!({
            "status": "error",
            "code": e.code(),
            "message": e.to_string(),
        });

        eprintln!("{}", error_json);
        process::exit(1);
    }
}
