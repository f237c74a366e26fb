// Crawlflow worker binary.
//
// Long-lived consumer process: assembles the runtime (store, queue, browser
// pool, recovery engine, scheduler), runs the worker loop, and drains
// gracefully on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crawlflow::config::EngineConfig;
use crawlflow::nodes::NodeRegistry;
use crawlflow::worker::{QueueBackend, WorkerRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::var("CRAWLFLOW_CONFIG") {
        Ok(path) => EngineConfig::from_file(&PathBuf::from(&path))
            .with_context(|| format!("loading config from {path}"))?,
        Err(_) => EngineConfig::default(),
    };

    let queue_backend = match std::env::var("CRAWLFLOW_QUEUE_DB") {
        Ok(path) => QueueBackend::Sqlite(PathBuf::from(path)),
        Err(_) => QueueBackend::Memory,
    };

    let runtime = WorkerRuntime::build(config, queue_backend, NodeRegistry::with_builtins(), true)
        .await
        .context("building worker runtime")?;

    // Graceful shutdown: first signal drains, second aborts.
    let shutdown = runtime.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received; draining");
            shutdown.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("second signal; exiting immediately");
            std::process::exit(130);
        }
    });

    runtime.run().await?;
    Ok(())
}
