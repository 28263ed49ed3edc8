//! Configuration for the deployment manager.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use convoy_messaging::MESSAGING_TYPE_IN_MEMORY;
use convoy_reconcile::{
    DEFAULT_HEARTBEAT_CHECK_INTERVAL, DEFAULT_HEARTBEAT_GRACE, DEFAULT_MESSAGE_CHECK_INTERVAL,
};

/// Value of `CONVOY_DATA_DIR` keeping instance trees in memory only.
pub const IN_MEMORY_DATA_DIR: &str = ":memory:";

/// Deployment manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory of the instance database, `None` to keep state in memory.
    pub data_dir: Option<PathBuf>,

    /// Messaging implementation used to reach agents.
    pub messaging_type: String,

    /// Period of the message checker.
    pub message_check_interval: Duration,

    /// Period of the heartbeat checker.
    pub heartbeat_check_interval: Duration,

    /// Silence tolerated before a started agent is declared lost.
    pub heartbeat_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: None,
            messaging_type: MESSAGING_TYPE_IN_MEMORY.to_string(),
            message_check_interval: DEFAULT_MESSAGE_CHECK_INTERVAL,
            heartbeat_check_interval: DEFAULT_HEARTBEAT_CHECK_INTERVAL,
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let log_level = std::env::var("CONVOY_LOG_LEVEL").unwrap_or(defaults.log_level);

        let data_dir = match std::env::var("CONVOY_DATA_DIR") {
            Ok(dir) if dir == IN_MEMORY_DATA_DIR => None,
            Ok(dir) => Some(PathBuf::from(dir)),
            Err(_) => Some(PathBuf::from("/var/lib/convoy")),
        };

        let messaging_type =
            std::env::var("CONVOY_MESSAGING_TYPE").unwrap_or(defaults.messaging_type);

        Ok(Self {
            log_level,
            data_dir,
            messaging_type,
            message_check_interval: millis_from_env(
                "CONVOY_MESSAGE_CHECK_INTERVAL_MS",
                defaults.message_check_interval,
            )?,
            heartbeat_check_interval: millis_from_env(
                "CONVOY_HEARTBEAT_CHECK_INTERVAL_MS",
                defaults.heartbeat_check_interval,
            )?,
            heartbeat_grace: millis_from_env("CONVOY_HEARTBEAT_GRACE_MS", defaults.heartbeat_grace)?,
        })
    }

    /// Path of the sqlite file holding instance trees.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("instances.db"))
    }
}

fn millis_from_env(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let millis: u64 = raw
                .parse()
                .with_context(|| format!("{name} must be a number of milliseconds, got {raw:?}"))?;
            Ok(Duration::from_millis(millis))
        }
        Err(_) => Ok(default),
    }
}
