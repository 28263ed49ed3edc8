//! Message type definitions.
//!
//! Each message is one variant of [`Message`]; the serialized form carries
//! a `type` tag next to the variant's fields.

use std::collections::BTreeMap;

use convoy_id::InstancePath;
use convoy_model::InstanceStatus;
use serde::{Deserialize, Serialize};

// =============================================================================
// Message Type Constants
// =============================================================================

/// All message type tags as constants.
pub mod message_types {
    // DM -> agent
    pub const CHANGE_STATE: &str = "change_state";
    pub const RESYNCHRONIZE: &str = "resynchronize";
    pub const REMOVE_INSTANCE: &str = "remove_instance";

    // agent -> DM
    pub const HEARTBEAT: &str = "heartbeat";
    pub const MACHINE_DOWN: &str = "machine_down";
    pub const INSTANCE_CHANGED: &str = "instance_changed";
    pub const INSTANCE_REMOVED: &str = "instance_removed";
    pub const EXPORT_ADDED: &str = "export_added";
    pub const EXPORT_REMOVED: &str = "export_removed";

    // both directions
    pub const ECHO: &str = "echo";
}

// =============================================================================
// Payload Types
// =============================================================================

/// What an agent needs to know about an instance it is asked to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub component: String,
    pub installer: String,

    /// Resolved exported variables.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,

    /// Imported variable names and whether they are optional.
    #[serde(default)]
    pub imports: BTreeMap<String, bool>,
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Ask the agent to move an instance to `new_status`.
    ChangeState {
        path: InstancePath,
        new_status: InstanceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance: Option<InstanceDescriptor>,
    },

    /// Ask the agent to publish its exports and statuses again.
    Resynchronize,

    /// The DM dropped an instance from its model.
    RemoveInstance { path: InstancePath },

    /// Periodic liveness signal of the agent managing `scope`.
    Heartbeat {
        scope: InstancePath,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip_address: Option<String>,
    },

    /// The machine of `scope` went away.
    MachineDown { scope: InstancePath },

    /// The agent observed a status change.
    InstanceChanged {
        path: InstancePath,
        status: InstanceStatus,
    },

    /// The agent dropped an instance.
    InstanceRemoved { path: InstancePath },

    /// An instance published its exported variables.
    ExportAdded {
        path: InstancePath,
        component: String,
        variables: BTreeMap<String, String>,
    },

    /// An instance withdrew its exported variables.
    ExportRemoved { path: InstancePath, component: String },

    Echo { content: String },
}

impl Message {
    /// The type tag of this message.
    pub fn message_type(&self) -> &'static str {
        use message_types::*;
        match self {
            Self::ChangeState { .. } => CHANGE_STATE,
            Self::Resynchronize => RESYNCHRONIZE,
            Self::RemoveInstance { .. } => REMOVE_INSTANCE,
            Self::Heartbeat { .. } => HEARTBEAT,
            Self::MachineDown { .. } => MACHINE_DOWN,
            Self::InstanceChanged { .. } => INSTANCE_CHANGED,
            Self::InstanceRemoved { .. } => INSTANCE_REMOVED,
            Self::ExportAdded { .. } => EXPORT_ADDED,
            Self::ExportRemoved { .. } => EXPORT_REMOVED,
            Self::Echo { .. } => ECHO,
        }
    }

    /// True for messages the DM sends to agents.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::ChangeState { .. } | Self::Resynchronize | Self::RemoveInstance { .. }
        )
    }

    pub fn change_state(path: InstancePath, new_status: InstanceStatus) -> Self {
        Self::ChangeState {
            path,
            new_status,
            instance: None,
        }
    }
}
