//! Plug-ins applying lifecycle actions to instances.
//!
//! A plug-in is chosen by the installer kind of the instance's component.
//! Instances of the `target` installer are machines: the DM provisions
//! them, so the agent only tracks their status.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use convoy_id::InstancePath;
use tracing::info;

use crate::error::PluginError;
use crate::instances::LocalInstance;

/// A lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Deploy,
    Start,
    Stop,
    Undeploy,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Undeploy => "undeploy",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies actions for one installer kind.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, action: Action, instance: &LocalInstance) -> Result<(), PluginError>;
}

/// Plug-in that only logs the actions it receives.
#[derive(Default)]
pub struct LoggerPlugin {
    history: Mutex<Vec<(Action, InstancePath)>>,
}

impl LoggerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actions applied so far, oldest first.
    pub fn history(&self) -> Vec<(Action, InstancePath)> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Plugin for LoggerPlugin {
    fn name(&self) -> &str {
        "logger"
    }

    async fn apply(&self, action: Action, instance: &LocalInstance) -> Result<(), PluginError> {
        info!(
            instance = %instance.path,
            component = %instance.component,
            %action,
            "Applying action"
        );
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((action, instance.path.clone()));
        Ok(())
    }
}

/// Plug-ins by installer kind, with an optional fallback.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    fallback: Option<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, installer: impl Into<String>, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.insert(installer.into(), plugin);
        self
    }

    /// Plug-in used for installers without a dedicated one.
    pub fn with_fallback(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.fallback = Some(plugin);
        self
    }

    pub fn get(&self, installer: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .get(installer)
            .or(self.fallback.as_ref())
            .cloned()
    }
}
