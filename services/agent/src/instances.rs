//! What the agent knows about the instances of its machine.

use std::collections::BTreeMap;

use convoy_id::InstancePath;
use convoy_messaging::InstanceDescriptor;
use convoy_model::{InstanceStatus, INSTALLER_TARGET};

use crate::plugin::Action;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInstance {
    pub path: InstancePath,
    pub component: String,
    pub installer: String,
    pub exports: BTreeMap<String, String>,
    pub status: InstanceStatus,
}

impl LocalInstance {
    pub fn new(path: InstancePath, descriptor: InstanceDescriptor) -> Self {
        Self {
            path,
            component: descriptor.component,
            installer: descriptor.installer,
            exports: descriptor.exports,
            status: InstanceStatus::NotDeployed,
        }
    }

    /// True for the machine itself.
    pub fn is_machine(&self) -> bool {
        self.installer == INSTALLER_TARGET
    }
}

/// Actions leading from `current` to `target`, or `None` if `target` cannot
/// be requested.
pub fn actions(current: InstanceStatus, target: InstanceStatus) -> Option<Vec<Action>> {
    use InstanceStatus::*;

    let actions = match (current, target) {
        (from, to) if from == to => vec![],
        (NotDeployed, DeployedStopped) => vec![Action::Deploy],
        (NotDeployed, DeployedStarted) => vec![Action::Deploy, Action::Start],
        (DeployedStopped, DeployedStarted) => vec![Action::Start],
        (DeployedStarted, DeployedStopped) => vec![Action::Stop],
        (DeployedStarted, NotDeployed) => vec![Action::Stop, Action::Undeploy],
        (_, NotDeployed) => vec![Action::Undeploy],
        (Problem, DeployedStopped) => vec![Action::Deploy],
        (Problem, DeployedStarted) => vec![Action::Deploy, Action::Start],
        _ => return None,
    };
    Some(actions)
}
