#![warn(missing_docs)]

//! script-runner
//!
//! Validates, bundles and runs automation scripts in V8 isolates behind a
//! small HTTP API.

use anyhow::{Context, Result};
use runner_config::ServiceConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("script-runner {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ServiceConfig::load().context("failed to load configuration")?;
    tracing::info!(
        port = config.server.port,
        timeout_ms = config.sandbox.timeout_ms,
        init_timeout_ms = config.sandbox.init_timeout_ms,
        max_heap_mb = config.sandbox.max_heap_mb,
        api_base_url = %config.api.base_url,
        "configuration loaded"
    );

    runner_server::serve(&config)
        .await
        .with_context(|| format!("server on {}:{} failed", config.server.host, config.server.port))
}
