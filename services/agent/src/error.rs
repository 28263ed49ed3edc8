//! Agent errors.

use convoy_id::InstancePath;
use convoy_messaging::MessagingError;
use convoy_model::InstanceStatus;
use thiserror::Error;

/// Failure of a plug-in action.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{plugin} failed to {action} {path}: {reason}")]
    Failed {
        plugin: String,
        action: &'static str,
        path: InstancePath,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum AgentError {
    /// A command targets an instance the agent was never told about.
    #[error("unknown instance: {0}")]
    UnknownInstance(InstancePath),

    /// A command targets an instance of another machine.
    #[error("{0} is not managed by this agent")]
    OutOfScope(InstancePath),

    #[error("cannot move {path} to {status}")]
    UnsupportedStatus {
        path: InstancePath,
        status: InstanceStatus,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("messaging error: {0}")]
    Messaging(#[from] MessagingError),
}
