//! Command dispatch

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::bus::{BroadcastProducer, FanoutConfig, FanoutService};
use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::observability::Logger;
use crate::rest_api;
use crate::schema::SchemaRegistry;

use super::args::Command;
use super::errors::CliError;

pub async fn run_command(command: Command) -> Result<(), CliError> {
    match command {
        Command::Serve { config } => serve(&config).await,
        Command::Fanout { config } => fanout(&config).await,
        Command::Genesis { config } => genesis(&config).await,
    }
}

async fn build_engine(config: &ServerConfig) -> Result<Engine, CliError> {
    let backend = config.storage.open().await.map_err(crate::core::error::EngineError::from)?;
    let registry = Arc::new(SchemaRegistry::new(backend));
    let mut engine = Engine::new(registry).with_auto_create_class(config.auto_create_class);

    if let Some(url) = &config.broadcast_url {
        engine = engine.with_producer(Arc::new(BroadcastProducer::new(url.clone())?));
    }
    Ok(engine)
}

async fn serve(config_path: &Path) -> Result<(), CliError> {
    let config = ServerConfig::load(config_path)?;
    let engine = Arc::new(build_engine(&config).await?);
    engine.registry().ensure_bootstrap().await?;

    let app = rest_api::router(Arc::clone(&engine), config.exports_dir.clone());
    let listener = TcpListener::bind(&config.http_addr).await?;

    Logger::info("SERVER_LISTENING", &[("addr", config.http_addr.as_str())]);
    axum::serve(listener, app)
        .await
        .map_err(std::io::Error::from)?;
    Ok(())
}

async fn fanout(config_path: &Path) -> Result<(), CliError> {
    let config = ServerConfig::load(config_path)?;
    let service = FanoutService::new(FanoutConfig {
        ws_addr: config.fanout_ws_addr.clone(),
        http_addr: config.fanout_http_addr.clone(),
    });
    service.run().await?;
    Ok(())
}

async fn genesis(config_path: &Path) -> Result<(), CliError> {
    let config = ServerConfig::load(config_path)?;
    let engine = build_engine(&config).await?;

    engine.registry().ensure_bootstrap().await?;
    let missing = engine.registry().verify_bootstrap().await?;

    let status = serde_json::json!({
        "status": if missing.is_empty() { "ok" } else { "incomplete" },
        "missing": missing,
    });
    println!("{}", status);
    Ok(())
}
