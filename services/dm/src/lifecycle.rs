//! Instance lifecycle state machine.
//!
//! A status request is turned into a plan of [`Step`]s. Each step:
//!
//! 1. queues one `ChangeState` command for the agent of the scoped instance
//!    and tries to flush it,
//! 2. commits the step's transient status,
//! 3. for scoped instances, asks the target handler for a machine (deploy)
//!    or to terminate it (undeploy),
//! 4. commits the step's resulting status and flushes again.
//!
//! Commands of a scoped instance are only flushed once it is started, so the
//! deploy and start commands of a new machine wait in its queue until the
//! start step commits. A failed step returns the error with the step name;
//! earlier steps stay committed.
//!
//! ```text
//!                    Deploy             Start
//!   NOT_DEPLOYED ───────────▶ STOPPED ─────────▶ STARTED
//!        ▲                    │   ▲                 │
//!        └────── Undeploy ────┘   └────── Stop ─────┘
//!
//!   PROBLEM and in-flight statuses can only be undeployed.
//! ```

use std::fmt;

use convoy_id::InstancePath;
use convoy_messaging::{InstanceDescriptor, Message};
use convoy_model::{InstanceStatus, DATA_MACHINE_ID};
use tracing::{debug, info, instrument, warn};

use crate::error::DmError;
use crate::managed::ManagedApplication;
use crate::manager::Manager;
use crate::targets::{MachineRequest, TargetError};

/// One hop of a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Deploy,
    Start,
    Stop,
    Undeploy,
}

impl Step {
    /// Status committed while the step is in flight.
    pub fn transient(&self) -> InstanceStatus {
        match self {
            Self::Deploy => InstanceStatus::Deploying,
            Self::Start => InstanceStatus::Starting,
            Self::Stop => InstanceStatus::Stopping,
            Self::Undeploy => InstanceStatus::Undeploying,
        }
    }

    /// Status committed once the step succeeded.
    pub fn outcome(&self) -> InstanceStatus {
        match self {
            Self::Deploy | Self::Stop => InstanceStatus::DeployedStopped,
            Self::Start => InstanceStatus::DeployedStarted,
            Self::Undeploy => InstanceStatus::NotDeployed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Undeploy => "undeploy",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps leading from `current` to `target`, or `None` if `target` is unreachable.
///
/// An empty plan means there is nothing to do.
pub fn plan(current: InstanceStatus, target: InstanceStatus) -> Option<Vec<Step>> {
    use InstanceStatus::*;

    if current == target {
        return Some(Vec::new());
    }
    if !target.is_requestable() {
        return None;
    }

    let steps = match (current, target) {
        (NotDeployed, DeployedStopped) => vec![Step::Deploy],
        (NotDeployed, DeployedStarted) => vec![Step::Deploy, Step::Start],
        (DeployedStopped, DeployedStarted) => vec![Step::Start],
        (DeployedStopped, NotDeployed) => vec![Step::Undeploy],
        (DeployedStarted, DeployedStopped) => vec![Step::Stop],
        (DeployedStarted, NotDeployed) => vec![Step::Stop, Step::Undeploy],
        (Problem | Deploying | Starting | Stopping | Undeploying, NotDeployed) => {
            vec![Step::Undeploy]
        }
        _ => return None,
    };
    Some(steps)
}

impl Manager {
    /// Moves one instance to `target`, going through every intermediate status.
    #[instrument(skip(self))]
    pub async fn change_instance_state(
        &self,
        application: &str,
        path: &InstancePath,
        target: InstanceStatus,
    ) -> Result<(), DmError> {
        self.check_configuration()?;
        let managed = self.application(application)?;
        let _op = managed.ops.lock().await;
        self.change_state_locked(&managed, path, target).await
    }

    /// Deploys and starts every NOT_DEPLOYED or DEPLOYED_STOPPED instance of
    /// the subtree at `from` (or of the whole application), parents first.
    #[instrument(skip(self))]
    pub async fn deploy_and_start_all(
        &self,
        application: &str,
        from: Option<&InstancePath>,
    ) -> Result<(), DmError> {
        self.walk(application, from, Walk::DeployAndStart).await
    }

    /// Stops every started instance of the subtree, children first.
    #[instrument(skip(self))]
    pub async fn stop_all(&self, application: &str, from: Option<&InstancePath>) -> Result<(), DmError> {
        self.walk(application, from, Walk::Stop).await
    }

    /// Undeploys every instance of the subtree, children first.
    #[instrument(skip(self))]
    pub async fn undeploy_all(
        &self,
        application: &str,
        from: Option<&InstancePath>,
    ) -> Result<(), DmError> {
        self.walk(application, from, Walk::Undeploy).await
    }

    async fn walk(
        &self,
        application: &str,
        from: Option<&InstancePath>,
        walk: Walk,
    ) -> Result<(), DmError> {
        self.check_configuration()?;
        let managed = self.application(application)?;
        let _op = managed.ops.lock().await;

        let paths = {
            let model = managed.model.read().await;
            if let Some(path) = from {
                if model.find(path).is_none() {
                    return Err(DmError::InstanceNotFound {
                        application: application.to_string(),
                        path: path.clone(),
                    });
                }
            }
            match walk {
                Walk::DeployAndStart => model.paths_preorder(from),
                Walk::Stop | Walk::Undeploy => model.paths_postorder(from),
            }
        };

        for path in paths {
            // Earlier steps may have changed the statuses of later paths.
            let Some(current) = managed.status_of(&path).await else {
                continue;
            };
            if let Some(target) = walk.target_for(current) {
                self.change_state_locked(&managed, &path, target).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn change_state_locked(
        &self,
        managed: &ManagedApplication,
        path: &InstancePath,
        target: InstanceStatus,
    ) -> Result<(), DmError> {
        let current = managed
            .status_of(path)
            .await
            .ok_or_else(|| DmError::InstanceNotFound {
                application: managed.name().to_string(),
                path: path.clone(),
            })?;

        let invalid = || DmError::InvalidTransition {
            path: path.clone(),
            from: current,
            to: target,
        };
        let steps = plan(current, target).ok_or_else(invalid)?;
        if steps.is_empty() {
            debug!(instance = %path, status = %current, "Instance already in requested status");
            return Ok(());
        }

        // Children need a deployed host.
        if steps.contains(&Step::Deploy) {
            if let Some(parent) = path.parent() {
                let parent_status = managed.status_of(&parent).await;
                if !matches!(
                    parent_status,
                    Some(InstanceStatus::DeployedStopped | InstanceStatus::DeployedStarted)
                ) {
                    return Err(invalid());
                }
            }
        }

        info!(app = %managed.name(), instance = %path, from = %current, to = %target, steps = steps.len(), "Changing instance state");

        let mut result = Ok(());
        for step in steps {
            if let Err(e) = self.run_step(managed, path, step).await {
                warn!(app = %managed.name(), instance = %path, step = %step, error = %e, "Lifecycle step failed");
                result = Err(e);
                break;
            }
        }

        self.persist(managed).await;
        result
    }

    async fn run_step(
        &self,
        managed: &ManagedApplication,
        path: &InstancePath,
        step: Step,
    ) -> Result<(), DmError> {
        let scope = path.scope();
        let has_machine = path.is_root() && self.is_machine_backed(managed, path).await;

        let command = self.command_for(managed, path, step).await;
        managed.queue().enqueue(&scope, command);
        self.flush_quietly(managed, &scope).await;

        self.set_status(managed, path, step.transient()).await;

        match step {
            Step::Deploy if has_machine => {
                if let Err(source) = self.provision(managed, path).await {
                    self.discard_queue(managed, &scope).await;
                    self.set_status(managed, path, InstanceStatus::NotDeployed).await;
                    return Err(DmError::TargetProvisioning {
                        path: path.clone(),
                        step,
                        source,
                    });
                }
            }
            Step::Undeploy => {
                if has_machine {
                    if let Err(source) = self.decommission(managed, path).await {
                        self.set_status(managed, path, InstanceStatus::Problem).await;
                        return Err(DmError::TargetProvisioning {
                            path: path.clone(),
                            step,
                            source,
                        });
                    }
                }
                self.set_descendants_status(managed, path, InstanceStatus::NotDeployed)
                    .await;
            }
            _ => {}
        }

        let outcome = step.outcome();
        self.set_status(managed, path, outcome).await;
        if path.is_root() && outcome == InstanceStatus::DeployedStarted {
            // The grace period of a new agent starts now.
            managed.record_heartbeat(path);
        }

        self.flush_quietly(managed, &scope).await;
        Ok(())
    }

    /// The `ChangeState` command of a step. Deploy commands describe the instance.
    async fn command_for(
        &self,
        managed: &ManagedApplication,
        path: &InstancePath,
        step: Step,
    ) -> Message {
        let mut message = Message::change_state(path.clone(), step.outcome());
        if step == Step::Deploy {
            let model = managed.model.read().await;
            let descriptor = model.find(path).and_then(|instance| {
                model.component_of(instance).map(|component| InstanceDescriptor {
                    component: component.name.clone(),
                    installer: component.installer.clone(),
                    exports: instance.exported_variables(component),
                    imports: component.imports.clone(),
                })
            });
            if let Message::ChangeState { instance, .. } = &mut message {
                *instance = descriptor;
            }
        }
        message
    }

    async fn is_machine_backed(&self, managed: &ManagedApplication, path: &InstancePath) -> bool {
        let model = managed.model.read().await;
        model
            .find(path)
            .and_then(|instance| model.component_of(instance))
            .is_some_and(|component| component.is_target())
    }

    /// Makes sure the scoped instance has a running machine.
    async fn provision(&self, managed: &ManagedApplication, scope: &InstancePath) -> Result<(), TargetError> {
        let handler = self.targets().resolve(managed.target_properties())?;
        let properties = managed.target_properties();

        let existing = managed
            .model
            .read()
            .await
            .find(scope)
            .and_then(|i| i.machine_id().map(str::to_owned));
        if let Some(machine_id) = existing {
            if handler.is_machine_running(properties, &machine_id).await? {
                info!(instance = %scope, machine_id = %machine_id, "Reusing running machine");
                return Ok(());
            }
        }

        let request = MachineRequest {
            application: managed.name().to_string(),
            scoped_instance: scope.clone(),
            messaging_type: self
                .messaging_client()
                .map(|c| c.messaging_type().to_string())
                .unwrap_or_else(|| self.config().messaging_type.clone()),
            properties: properties.clone(),
        };
        let machine_id = handler.create_machine(&request).await?;
        info!(instance = %scope, machine_id = %machine_id, target_id = handler.target_id(), "Machine created");

        if let Some(instance) = managed.model.write().await.find_mut(scope) {
            instance.data.insert(DATA_MACHINE_ID.to_string(), machine_id);
        }
        Ok(())
    }

    /// Terminates the machine of a scoped instance and drops what was queued for it.
    async fn decommission(&self, managed: &ManagedApplication, scope: &InstancePath) -> Result<(), TargetError> {
        let machine_id = managed
            .model
            .read()
            .await
            .find(scope)
            .and_then(|i| i.machine_id().map(str::to_owned));

        if let Some(machine_id) = machine_id {
            let handler = self.targets().resolve(managed.target_properties())?;
            handler
                .terminate_machine(managed.target_properties(), &machine_id)
                .await?;
            info!(instance = %scope, machine_id = %machine_id, "Machine terminated");
        }

        self.discard_queue(managed, scope).await;
        self.clear_machine(managed, scope).await;
        Ok(())
    }

    /// Confirms the machines of restored scoped instances with their handlers.
    ///
    /// Dead machines put their whole subtree back to NOT_DEPLOYED; started
    /// agents on live machines are asked to resynchronize.
    #[instrument(skip(self))]
    pub async fn restore_instance_states(&self, application: &str) -> Result<(), DmError> {
        let managed = self.application(application)?;
        let _op = managed.ops.lock().await;

        let scopes: Vec<_> = {
            let model = managed.model.read().await;
            model
                .scoped_paths()
                .into_iter()
                .filter_map(|scope| {
                    let instance = model.find(&scope)?;
                    let backed = model.component_of(instance).is_some_and(|c| c.is_target());
                    (backed && instance.status != InstanceStatus::NotDeployed).then(|| {
                        (scope, instance.status, instance.machine_id().map(str::to_owned))
                    })
                })
                .collect()
        };

        for (scope, status, machine_id) in scopes {
            let alive = match machine_id {
                None => false,
                Some(machine_id) => match self.targets().resolve(managed.target_properties()) {
                    Ok(handler) => {
                        match handler
                            .is_machine_running(managed.target_properties(), &machine_id)
                            .await
                        {
                            Ok(running) => running,
                            Err(e) => {
                                warn!(instance = %scope, error = %e, "Cannot check machine, leaving state untouched");
                                continue;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(instance = %scope, error = %e, "No handler to check machine");
                        continue;
                    }
                },
            };

            if alive {
                if status == InstanceStatus::DeployedStarted {
                    managed.record_heartbeat(&scope);
                    self.send_to_scope(&managed, &scope, Message::Resynchronize).await;
                }
                debug!(instance = %scope, "Machine confirmed");
            } else {
                info!(instance = %scope, "Machine is gone, resetting instances");
                self.discard_queue(&managed, &scope).await;
                self.clear_machine(&managed, &scope).await;
                self.set_descendants_status(&managed, &scope, InstanceStatus::NotDeployed)
                    .await;
                self.set_status(&managed, &scope, InstanceStatus::NotDeployed).await;
            }
        }

        self.persist(&managed).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Walk {
    DeployAndStart,
    Stop,
    Undeploy,
}

impl Walk {
    /// Status to request for an instance met during the walk, if any.
    fn target_for(&self, current: InstanceStatus) -> Option<InstanceStatus> {
        use InstanceStatus::*;
        match (self, current) {
            (Self::DeployAndStart, NotDeployed | DeployedStopped) => Some(DeployedStarted),
            (Self::Stop, DeployedStarted) => Some(DeployedStopped),
            (Self::Undeploy, NotDeployed) => None,
            (Self::Undeploy, _) => Some(NotDeployed),
            _ => None,
        }
    }
}
