//! Agent-side message processing.
//!
//! The processor owns the local instance table and handles the commands of
//! its machine's channel one at a time. Every outcome is reported to the
//! DM channel of the application.

use std::collections::BTreeMap;
use std::sync::Arc;

use convoy_id::{ChannelId, InstancePath};
use convoy_messaging::{InstanceDescriptor, Message, MessagingClient, Subscription};
use convoy_model::InstanceStatus;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::AgentError;
use crate::instances::{actions, LocalInstance};
use crate::plugin::{Action, PluginRegistry};

/// Prefix of echo messages expecting an answer.
pub const PING_PREFIX: &str = "PING:";
/// Prefix of echo answers.
pub const PONG_PREFIX: &str = "PONG:";

pub struct AgentProcessor {
    application: String,
    scope: InstancePath,
    client: Arc<dyn MessagingClient>,
    plugins: PluginRegistry,
    instances: BTreeMap<InstancePath, LocalInstance>,
}

impl AgentProcessor {
    pub fn new(
        application: impl Into<String>,
        scope: InstancePath,
        client: Arc<dyn MessagingClient>,
        plugins: PluginRegistry,
    ) -> Self {
        Self {
            application: application.into(),
            scope,
            client,
            plugins,
            instances: BTreeMap::new(),
        }
    }

    /// Channel this agent listens to.
    pub fn channel(&self) -> ChannelId {
        ChannelId::agent(&self.application, &self.scope)
    }

    pub fn instance(&self, path: &InstancePath) -> Option<&LocalInstance> {
        self.instances.get(path)
    }

    pub fn instances(&self) -> impl Iterator<Item = &LocalInstance> {
        self.instances.values()
    }

    /// Processes commands until shutdown or until the channel closes.
    #[instrument(skip_all, fields(app = %self.application, scope = %self.scope))]
    pub async fn run(mut self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        info!("Agent processor started");

        loop {
            tokio::select! {
                envelope = subscription.recv() => {
                    let Some(envelope) = envelope else {
                        debug!("Channel closed");
                        break;
                    };
                    let message_type = envelope.message.message_type();
                    if let Err(e) = self.process(envelope.message).await {
                        warn!(message_id = %envelope.id, message_type, error = %e, "Failed to process command");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Agent processor stopped");
    }

    /// Handles one message.
    pub async fn process(&mut self, message: Message) -> Result<(), AgentError> {
        match message {
            Message::ChangeState {
                path,
                new_status,
                instance,
            } => self.change_state(path, new_status, instance).await,
            Message::Resynchronize => self.resynchronize().await,
            Message::RemoveInstance { path } => self.remove(&path).await,
            Message::Echo { content } => self.echo(content).await,
            other => {
                warn!(message_type = other.message_type(), "Unexpected message on the agent channel");
                Ok(())
            }
        }
    }

    async fn change_state(
        &mut self,
        path: InstancePath,
        target: InstanceStatus,
        descriptor: Option<InstanceDescriptor>,
    ) -> Result<(), AgentError> {
        if !path.is_within(&self.scope) {
            return Err(AgentError::OutOfScope(path));
        }

        let mut instance = match (self.instances.remove(&path), descriptor) {
            (Some(mut known), Some(descriptor)) => {
                // Deploy commands carry fresh exports.
                known.exports = descriptor.exports;
                known
            }
            (Some(known), None) => known,
            (None, Some(descriptor)) => LocalInstance::new(path.clone(), descriptor),
            (None, None) => return Err(AgentError::UnknownInstance(path)),
        };

        let Some(plan) = actions(instance.status, target) else {
            let status = instance.status;
            self.instances.insert(path.clone(), instance);
            warn!(instance = %path, from = %status, to = %target, "Unsupported status request");
            return Err(AgentError::UnsupportedStatus { path, status: target });
        };

        let was_started = instance.status == InstanceStatus::DeployedStarted;
        let outcome = self.apply(&mut instance, &plan).await;

        let status = instance.status;
        let exports = instance.exports.clone();
        let component = instance.component.clone();
        if status != InstanceStatus::NotDeployed {
            self.instances.insert(path.clone(), instance);
        }

        self.notify(Message::InstanceChanged {
            path: path.clone(),
            status,
        })
        .await?;

        let is_started = status == InstanceStatus::DeployedStarted;
        if !exports.is_empty() && was_started != is_started {
            let message = if is_started {
                Message::ExportAdded {
                    path,
                    component,
                    variables: exports,
                }
            } else {
                Message::ExportRemoved { path, component }
            };
            self.notify(message).await?;
        }

        outcome
    }

    /// Runs the plug-in actions of `plan`, updating the instance status as
    /// they succeed. A failed action leaves the instance in PROBLEM.
    async fn apply(&self, instance: &mut LocalInstance, plan: &[Action]) -> Result<(), AgentError> {
        let plugin = if instance.is_machine() {
            None
        } else {
            self.plugins.get(&instance.installer)
        };

        for action in plan {
            if let Some(plugin) = &plugin {
                if let Err(e) = plugin.apply(*action, instance).await {
                    error!(instance = %instance.path, %action, plugin = plugin.name(), error = %e, "Action failed");
                    instance.status = InstanceStatus::Problem;
                    return Err(e.into());
                }
            } else if !instance.is_machine() {
                debug!(instance = %instance.path, installer = %instance.installer, "No plug-in, status only");
            }

            instance.status = match action {
                Action::Deploy | Action::Stop => InstanceStatus::DeployedStopped,
                Action::Start => InstanceStatus::DeployedStarted,
                Action::Undeploy => InstanceStatus::NotDeployed,
            };
        }
        Ok(())
    }

    async fn resynchronize(&mut self) -> Result<(), AgentError> {
        info!(instances = self.instances.len(), "Resynchronizing with the DM");

        let snapshot: Vec<_> = self.instances.values().cloned().collect();
        for instance in snapshot {
            self.notify(Message::InstanceChanged {
                path: instance.path.clone(),
                status: instance.status,
            })
            .await?;
            if instance.status == InstanceStatus::DeployedStarted && !instance.exports.is_empty() {
                self.notify(Message::ExportAdded {
                    path: instance.path,
                    component: instance.component,
                    variables: instance.exports,
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn remove(&mut self, path: &InstancePath) -> Result<(), AgentError> {
        let removed: Vec<_> = self
            .instances
            .keys()
            .filter(|p| p.is_within(path))
            .cloned()
            .collect();
        for p in &removed {
            self.instances.remove(p);
        }
        debug!(instance = %path, removed = removed.len(), "Instance removed");
        self.notify(Message::InstanceRemoved { path: path.clone() })
            .await
    }

    async fn echo(&self, content: String) -> Result<(), AgentError> {
        match content.strip_prefix(PING_PREFIX) {
            Some(payload) => {
                self.notify(Message::Echo {
                    content: format!("{PONG_PREFIX}{payload}"),
                })
                .await
            }
            None => {
                debug!(content, "Echo received");
                Ok(())
            }
        }
    }

    async fn notify(&self, message: Message) -> Result<(), AgentError> {
        let channel = ChannelId::dm(&self.application);
        self.client.send(&channel, &message).await?;
        Ok(())
    }
}
