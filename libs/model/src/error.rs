//! Error types for model manipulation.

use convoy_id::{IdError, InstancePath};
use thiserror::Error;

/// Errors raised while navigating or mutating an instance tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("instance not found: {0}")]
    InstanceNotFound(InstancePath),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    /// The component cannot be instantiated at the root of the tree.
    #[error("component {component} cannot be used for a root instance")]
    NotARoot { component: String },

    /// The parent's component does not list the child's component.
    #[error("component {component} cannot be a child of {parent_component}")]
    NotAChild {
        parent_component: String,
        component: String,
    },

    /// A sibling already uses this name. `parent` is `/` for roots.
    #[error("an instance named {name} already exists under {parent}")]
    DuplicateName { parent: String, name: String },

    /// Some instance in the subtree is still deployed.
    #[error("instance {0} (or one of its children) is still deployed")]
    StillDeployed(InstancePath),

    #[error(transparent)]
    Id(#[from] IdError),
}
