//! Configuration for the agent.

use anyhow::{Context, Result};
use convoy_id::InstancePath;
use convoy_messaging::MESSAGING_TYPE_IN_MEMORY;

/// Heartbeat interval used when none is configured.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application the agent works for.
    pub application: String,

    /// The scoped instance (machine) this agent manages.
    pub scoped_instance: InstancePath,

    /// Messaging implementation used to reach the DM.
    pub messaging_type: String,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Address reported with heartbeats.
    pub ip_address: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let application =
            std::env::var("CONVOY_APPLICATION").context("CONVOY_APPLICATION must be set")?;

        let scoped_instance = std::env::var("CONVOY_SCOPED_INSTANCE")
            .context("CONVOY_SCOPED_INSTANCE must be set")?;
        let scoped_instance = InstancePath::parse(&scoped_instance)
            .with_context(|| format!("invalid CONVOY_SCOPED_INSTANCE: {scoped_instance}"))?;

        let messaging_type = std::env::var("CONVOY_MESSAGING_TYPE")
            .unwrap_or_else(|_| MESSAGING_TYPE_IN_MEMORY.to_string());

        let heartbeat_interval_secs = std::env::var("CONVOY_HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS);

        let ip_address = std::env::var("CONVOY_IP_ADDRESS").ok();

        let log_level = std::env::var("CONVOY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            application,
            scoped_instance,
            messaging_type,
            heartbeat_interval_secs,
            ip_address,
            log_level,
        })
    }

    /// True if `path` belongs to the machine of this agent.
    pub fn manages(&self, path: &InstancePath) -> bool {
        path.is_within(&self.scoped_instance)
    }
}
