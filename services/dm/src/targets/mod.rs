//! Target handlers: the backends that create and destroy machines.
//!
//! Each application names its handler in its target properties under
//! [`TARGET_HANDLER_PROPERTY`]. Handlers are registered on the manager at
//! runtime and looked up by id whenever a scoped instance is deployed or
//! undeployed.

mod in_memory;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use convoy_id::InstancePath;
use thiserror::Error;
use tracing::info;

pub use in_memory::{InMemoryTarget, IN_MEMORY_TARGET_ID};

/// Target property selecting the handler of an application.
pub const TARGET_HANDLER_PROPERTY: &str = "handler";

/// Free-form settings passed to target handlers (credentials, image, region...).
pub type TargetProperties = BTreeMap<String, String>;

#[derive(Debug, Clone, Error)]
pub enum TargetError {
    /// No handler is registered under the requested id.
    #[error("no target handler registered as {0:?}")]
    UnknownHandler(String),

    /// The application does not say which handler to use.
    #[error("target properties do not name a handler")]
    NoHandler,

    /// The backend refused or failed the operation.
    #[error("{0}")]
    Backend(String),
}

/// Everything a handler needs to bring up the machine of a scoped instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRequest {
    pub application: String,
    pub scoped_instance: InstancePath,
    /// Messaging type the agent of the new machine must use.
    pub messaging_type: String,
    pub properties: TargetProperties,
}

#[async_trait]
pub trait TargetHandler: Send + Sync {
    /// Identifier used in target properties.
    fn target_id(&self) -> &str;

    /// Creates a machine and returns its id.
    async fn create_machine(&self, request: &MachineRequest) -> Result<String, TargetError>;

    async fn is_machine_running(
        &self,
        properties: &TargetProperties,
        machine_id: &str,
    ) -> Result<bool, TargetError>;

    async fn terminate_machine(
        &self,
        properties: &TargetProperties,
        machine_id: &str,
    ) -> Result<(), TargetError>;
}

/// Handlers available to the manager, by id.
#[derive(Default)]
pub struct TargetRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TargetHandler>>>,
}

impl TargetRegistry {
    /// Registers a handler, replacing any handler with the same id.
    pub fn register(&self, handler: Arc<dyn TargetHandler>) -> Option<Arc<dyn TargetHandler>> {
        let id = handler.target_id().to_string();
        info!(target_id = %id, "Target handler registered");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handler)
    }

    pub fn unregister(&self, target_id: &str) -> Option<Arc<dyn TargetHandler>> {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target_id);
        if removed.is_some() {
            info!(target_id, "Target handler unregistered");
        }
        removed
    }

    pub fn get(&self, target_id: &str) -> Option<Arc<dyn TargetHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target_id)
            .cloned()
    }

    /// The handler named by an application's target properties.
    pub fn resolve(&self, properties: &TargetProperties) -> Result<Arc<dyn TargetHandler>, TargetError> {
        let id = properties
            .get(TARGET_HANDLER_PROPERTY)
            .ok_or(TargetError::NoHandler)?;
        self.get(id)
            .ok_or_else(|| TargetError::UnknownHandler(id.clone()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
