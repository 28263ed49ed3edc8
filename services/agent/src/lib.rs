//! convoy Agent Library
//!
//! An agent runs on each machine created for a scoped instance. It applies
//! the lifecycle commands the DM sends for the instances of that machine
//! and reports statuses, exports and heartbeats back.
//!
//! ```text
//! DM ──ChangeState / Resynchronize / RemoveInstance──▶ AgentProcessor ──▶ plug-ins
//! DM ◀──InstanceChanged / ExportAdded / Heartbeat───── agent
//! ```

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod instances;
pub mod plugin;
pub mod processor;

pub use config::Config;
pub use error::{AgentError, PluginError};
pub use plugin::{Action, LoggerPlugin, Plugin, PluginRegistry};
pub use processor::AgentProcessor;
