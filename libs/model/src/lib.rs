//! # convoy-model
//!
//! The runtime model shared by the deployment manager and its agents.
//!
//! ```text
//! Application ── Graphs ── Component*
//!      │
//!      └── Instance* (root = scoped instance, one machine each)
//!              └── Instance* ...
//! ```
//!
//! Graphs are immutable once loaded. Instance trees are owned by their
//! application: a parent exclusively owns its children and removing it
//! removes the whole subtree. Instance statuses are only mutated by the
//! lifecycle layer of the DM or by agent notifications.

mod application;
mod component;
mod error;
mod instance;

pub use application::Application;
pub use component::{Component, Graphs, INSTALLER_TARGET};
pub use error::ModelError;
pub use instance::{Import, Instance, InstanceStatus, DATA_IP_ADDRESS, DATA_MACHINE_ID};
