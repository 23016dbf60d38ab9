//! PVM node: one engine plus its job executor, with the definitions in
//! `PVM_DEFINITIONS_DIR` deployed at startup.

mod handlers;

use anyhow::{Context, Result};
use pvm_core::config::EngineConfig;
use pvm_core::events::TracingEventListener;
use pvm_core::jobexecutor::JobExecutor;
use pvm_core::store::PersistenceSession;
use pvm_core::ProcessEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pvm_core=debug")),
        )
        .init();

    let config = match std::env::var("PVM_CONFIG") {
        Ok(path) => EngineConfig::load_from_file(Path::new(&path))?,
        Err(_) => EngineConfig::default(),
    }
    .with_env_overrides()
    .context("Applying PVM_* overrides")?;

    tracing::info!(
        node_id = %config.node_id,
        pool_size = config.job_executor.pool_size,
        "pvm-node starting"
    );

    let store = open_store().await?;
    let engine = handlers::register(ProcessEngine::builder())
        .config(config)
        .store(store)
        .listener(Arc::new(TracingEventListener))
        .build();

    let dir = PathBuf::from(
        std::env::var("PVM_DEFINITIONS_DIR").unwrap_or_else(|_| "definitions".to_string()),
    );
    deploy_dir(&engine, &dir)?;

    let handle = JobExecutor::new(engine).start();

    tokio::signal::ctrl_c()
        .await
        .context("Waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    handle.shutdown().await;
    tracing::info!("pvm-node stopped");
    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_store() -> Result<Arc<dyn PersistenceSession>> {
    use pvm_core::store::{MemoryStore, PgStore};

    let Ok(url) = std::env::var("DATABASE_URL") else {
        tracing::warn!("DATABASE_URL not set, using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let store = PgStore::connect(&url).await?;
    store.migrate().await?;
    tracing::info!("connected to Postgres");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_store() -> Result<Arc<dyn PersistenceSession>> {
    tracing::info!("using in-memory store");
    Ok(Arc::new(pvm_core::store::MemoryStore::new()))
}

/// Deploy every `*.yaml` file in `dir`, in file name order.
fn deploy_dir(engine: &ProcessEngine, dir: &Path) -> Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Reading definitions directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
        .collect();
    paths.sort();

    for path in paths {
        let yaml = std::fs::read_to_string(&path)
            .with_context(|| format!("Reading {}", path.display()))?;
        let deployed = engine
            .deploy_yaml(&yaml)
            .with_context(|| format!("Deploying {}", path.display()))?;
        tracing::info!(
            definition_id = %deployed.id,
            file = %path.display(),
            "definition deployed"
        );
    }
    Ok(())
}
