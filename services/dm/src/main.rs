//! convoy Deployment Manager
//!
//! Keeps the instance model of every application, drives lifecycle changes
//! through the agents and watches their heartbeats.

use std::sync::Arc;

use anyhow::Result;
use convoy_dm::{
    config,
    store::{InstanceStore, MemoryInstanceStore, SqliteInstanceStore},
    targets::InMemoryTarget,
    Manager,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to CONVOY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting convoy deployment manager");

    let store: Arc<dyn InstanceStore> = match config.database_path() {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            match SqliteInstanceStore::open(&path) {
                Ok(store) => {
                    info!(path = %path.display(), "Instance store opened");
                    Arc::new(store)
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open instance store");
                    return Err(e.into());
                }
            }
        }
        None => {
            info!("Keeping instances in memory");
            Arc::new(MemoryInstanceStore::new())
        }
    };

    let manager = Manager::new(config.clone(), store);
    manager.configure_messaging(&config.messaging_type)?;
    let mut in_memory = InMemoryTarget::new();
    if let Some(client) = manager.messaging_client() {
        in_memory = in_memory.with_agents(client);
    }
    manager.register_target(Arc::new(in_memory));
    manager.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    manager.stop().await;
    info!("Deployment manager shutdown complete");
    Ok(())
}
