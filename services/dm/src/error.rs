//! Errors returned by deployment manager operations.
//!
//! Only validation, configuration and provisioning failures reach callers.
//! Transport failures stay inside the outbound queues and are retried by the
//! message checker.

use convoy_id::InstancePath;
use convoy_messaging::MessagingError;
use convoy_model::{InstanceStatus, ModelError};
use thiserror::Error;

use crate::lifecycle::Step;
use crate::store::StoreError;
use crate::targets::TargetError;

#[derive(Debug, Error)]
pub enum DmError {
    /// The requested status cannot be reached from the current one.
    #[error("{path} cannot go from {from} to {to}")]
    InvalidTransition {
        path: InstancePath,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    /// A target handler failed to create, confirm or terminate a machine.
    #[error("{step} of {path} failed: {source}")]
    TargetProvisioning {
        path: InstancePath,
        step: Step,
        #[source]
        source: TargetError,
    },

    /// The instance does not fit the graph or its siblings.
    #[error("impossible insertion: {0}")]
    ImpossibleInsertion(#[source] ModelError),

    /// The action would destroy something still deployed.
    #[error("unauthorized action: {0}")]
    UnauthorizedAction(String),

    /// The manager is not started or messaging is not configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("instance not found: {path} in {application}")]
    InstanceNotFound {
        application: String,
        path: InstancePath,
    },

    #[error("application already exists: {0}")]
    AlreadyExisting(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Only diagnostics sent outside the queues report transport failures.
    #[error("messaging error: {0}")]
    Messaging(#[from] MessagingError),
}

impl DmError {
    /// Returns true if the failure comes from the caller's request.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::ImpossibleInsertion(_)
                | Self::UnauthorizedAction(_)
                | Self::ApplicationNotFound(_)
                | Self::InstanceNotFound { .. }
                | Self::AlreadyExisting(_)
        )
    }

    /// The lifecycle step that failed, for provisioning errors.
    pub fn failed_step(&self) -> Option<Step> {
        match self {
            Self::TargetProvisioning { step, .. } => Some(*step),
            _ => None,
        }
    }
}
