//! convoy Agent
//!
//! Applies the DM's commands to the instances of one machine and sends
//! heartbeats while it runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use convoy_agent::{config, heartbeat, AgentProcessor, LoggerPlugin, PluginRegistry};
use convoy_messaging::{client_for, MESSAGING_TYPE_IN_MEMORY};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to CONVOY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        app = %config.application,
        scope = %config.scoped_instance,
        messaging_type = %config.messaging_type,
        "Starting convoy agent"
    );

    if config.messaging_type == MESSAGING_TYPE_IN_MEMORY {
        warn!("In-memory messaging only reaches a DM running in this process");
    }

    let client = client_for(&config.messaging_type)?;
    let plugins = PluginRegistry::new().with_fallback(Arc::new(LoggerPlugin::new()));
    let processor = AgentProcessor::new(
        config.application.clone(),
        config.scoped_instance.clone(),
        client.clone(),
        plugins,
    );
    let subscription = client.subscribe(&processor.channel()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { processor.run(subscription, shutdown_rx).await }
    });

    let heartbeat_handle = tokio::spawn({
        let config = config.clone();
        let client = client.clone();
        async move {
            if let Err(e) = heartbeat::run_heartbeat_loop(config, client, shutdown_rx).await {
                error!(error = %e, "Heartbeat loop failed");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, processor_handle).await {
        warn!(error = %e, "Agent processor did not shut down in time");
    }
    if let Err(e) = tokio::time::timeout(shutdown_timeout, heartbeat_handle).await {
        warn!(error = %e, "Heartbeat loop did not shut down in time");
    }

    info!("Agent shutdown complete");
    Ok(())
}
