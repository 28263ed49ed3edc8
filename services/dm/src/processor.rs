//! Inbound message processing.
//!
//! One processor runs per application and consumes the application's DM
//! channel in order. A separate processor listens to the debug channel.
//! Messages are handled one at a time; a handler failure is logged and the
//! loop moves on to the next message.

use convoy_id::{ChannelId, InstancePath};
use convoy_messaging::{Message, Subscription};
use convoy_model::{Import, InstanceStatus, DATA_IP_ADDRESS};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::DmError;
use crate::events::{DmEvent, EventKind};
use crate::managed::ManagedApplication;
use crate::manager::Manager;

pub struct DmProcessor {
    manager: Manager,
    /// `None` for the debug channel processor.
    application: Option<String>,
}

impl DmProcessor {
    pub fn for_application(manager: Manager, application: &str) -> Self {
        Self {
            manager,
            application: Some(application.to_string()),
        }
    }

    pub fn debug(manager: Manager) -> Self {
        Self {
            manager,
            application: None,
        }
    }

    fn channel(&self) -> ChannelId {
        match &self.application {
            Some(name) => ChannelId::dm(name),
            None => ChannelId::Debug,
        }
    }

    /// Consumes `subscription` until shutdown or until the channel closes.
    #[instrument(skip_all, fields(channel = %self.channel()))]
    pub async fn run(self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        info!("Message processor started");

        loop {
            tokio::select! {
                envelope = subscription.recv() => {
                    let Some(envelope) = envelope else {
                        debug!("Channel closed");
                        break;
                    };
                    debug!(message_id = %envelope.id, message_type = envelope.message.message_type(), "Processing message");
                    self.process(envelope.message).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Message processor stopped");
    }

    /// Handles one message.
    pub async fn process(&self, message: Message) {
        let Some(application) = &self.application else {
            self.process_debug(message);
            return;
        };

        let managed = match self.manager.application(application) {
            Ok(managed) => managed,
            Err(e) => {
                warn!(app = %application, error = %e, "Dropping message for unknown application");
                return;
            }
        };

        let message_type = message.message_type();
        if let Err(e) = self.dispatch(&managed, message).await {
            warn!(app = %application, message_type, error = %e, "Failed to process message");
        }
    }

    fn process_debug(&self, message: Message) {
        match message {
            Message::Echo { content } => {
                debug!(content, "Echo on the debug channel");
                self.manager.notify(DmEvent::Raw {
                    application: None,
                    content,
                });
            }
            other => debug!(message_type = other.message_type(), "Ignoring message on the debug channel"),
        }
    }

    async fn dispatch(&self, managed: &ManagedApplication, message: Message) -> Result<(), DmError> {
        match message {
            Message::Heartbeat { scope, ip_address } => {
                self.on_heartbeat(managed, &scope, ip_address).await
            }
            Message::MachineDown { scope } => self.on_machine_down(managed, &scope).await,
            Message::InstanceChanged { path, status } => {
                self.on_instance_changed(managed, &path, status).await
            }
            Message::InstanceRemoved { path } => self.on_instance_removed(managed, &path).await,
            Message::ExportAdded {
                path,
                component,
                variables,
            } => {
                self.on_exports(managed, &path, &component, Some(variables))
                    .await
            }
            Message::ExportRemoved { path, component } => {
                self.on_exports(managed, &path, &component, None).await
            }
            Message::Echo { content } => {
                self.manager.notify(DmEvent::Raw {
                    application: Some(managed.name().to_string()),
                    content,
                });
                Ok(())
            }
            command => {
                warn!(app = %managed.name(), message_type = command.message_type(), "Agent command received on the DM channel");
                Ok(())
            }
        }
    }

    async fn on_heartbeat(
        &self,
        managed: &ManagedApplication,
        scope: &InstancePath,
        ip_address: Option<String>,
    ) -> Result<(), DmError> {
        let status = managed
            .status_of(scope)
            .await
            .ok_or_else(|| not_found(managed, scope))?;
        managed.record_heartbeat(scope);

        if let Some(ip) = ip_address {
            if let Some(instance) = managed.model.write().await.find_mut(scope) {
                instance.data.insert(DATA_IP_ADDRESS.to_string(), ip);
            }
        }

        if status == InstanceStatus::Problem {
            info!(app = %managed.name(), instance = %scope, "Agent is back");
            self.manager
                .set_status(managed, scope, InstanceStatus::DeployedStarted)
                .await;
            // Descendants were marked PROBLEM with the scope; the agent
            // reports their real statuses again.
            self.manager
                .send_to_scope(managed, scope, Message::Resynchronize)
                .await;
        } else {
            self.manager.flush_quietly(managed, scope).await;
        }

        self.manager.persist(managed).await;
        Ok(())
    }

    async fn on_machine_down(&self, managed: &ManagedApplication, scope: &InstancePath) -> Result<(), DmError> {
        let status = managed
            .status_of(scope)
            .await
            .ok_or_else(|| not_found(managed, scope))?;

        // Expected when the machine was being terminated.
        let expected = matches!(status, InstanceStatus::Undeploying | InstanceStatus::NotDeployed);
        let scope_status = if expected {
            InstanceStatus::NotDeployed
        } else {
            warn!(app = %managed.name(), instance = %scope, status = %status, "Machine went down");
            InstanceStatus::Problem
        };

        self.manager.set_status(managed, scope, scope_status).await;
        self.manager
            .set_descendants_status(managed, scope, InstanceStatus::NotDeployed)
            .await;
        managed.forget_liveness(scope);
        self.manager.persist(managed).await;
        Ok(())
    }

    async fn on_instance_changed(
        &self,
        managed: &ManagedApplication,
        path: &InstancePath,
        status: InstanceStatus,
    ) -> Result<(), DmError> {
        let scope_status = managed
            .status_of(&path.scope())
            .await
            .ok_or_else(|| not_found(managed, path))?;

        // Late reports about a machine being terminated or already gone.
        if matches!(scope_status, InstanceStatus::NotDeployed | InstanceStatus::Undeploying)
            && status != InstanceStatus::NotDeployed
        {
            debug!(app = %managed.name(), instance = %path, reported = %status, "Ignoring report for a terminated machine");
            return Ok(());
        }

        self.manager
            .set_status(managed, path, status)
            .await
            .ok_or_else(|| not_found(managed, path))?;

        if path.is_root() && status == InstanceStatus::DeployedStarted {
            managed.record_heartbeat(path);
            self.manager.flush_quietly(managed, path).await;
        }
        self.manager.persist(managed).await;
        Ok(())
    }

    async fn on_instance_removed(&self, managed: &ManagedApplication, path: &InstancePath) -> Result<(), DmError> {
        let removed = {
            let mut model = managed.model.write().await;
            let Some(instance) = model.find_mut(path) else {
                // Acknowledgement of a removal requested by the DM.
                debug!(app = %managed.name(), instance = %path, "Instance already removed");
                return Ok(());
            };
            instance.reset_status(InstanceStatus::NotDeployed);
            model.remove(path)
        };

        match removed {
            Ok(instance) => {
                if path.is_root() {
                    self.manager.discard_queue(managed, path).await;
                    managed.forget_liveness(path);
                }
                info!(app = %managed.name(), instance = %path, "Agent removed instance");
                self.manager.notify(DmEvent::instance(
                    EventKind::Deleted,
                    managed.name(),
                    path,
                    instance.status,
                ));
                self.manager.persist(managed).await;
                Ok(())
            }
            Err(e) => Err(DmError::ImpossibleInsertion(e)),
        }
    }

    /// Adds or withdraws the exports of `path` in every importer of `component`.
    async fn on_exports(
        &self,
        managed: &ManagedApplication,
        path: &InstancePath,
        component: &str,
        variables: Option<BTreeMap<String, String>>,
    ) -> Result<(), DmError> {
        let updated: Vec<_> = {
            let mut model = managed.model.write().await;
            if model.find(path).is_none() {
                return Err(not_found(managed, path));
            }

            let importers: Vec<_> = model
                .importers_of(component)
                .into_iter()
                .filter(|importer| importer != path)
                .collect();

            importers
                .into_iter()
                .filter_map(|importer| {
                    let instance = model.find_mut(&importer)?;
                    let imports = instance.imports.entry(component.to_string()).or_default();
                    let before = imports.len();
                    imports.retain(|i| &i.instance_path != path);
                    let changed = match &variables {
                        Some(variables) => {
                            imports.push(Import {
                                instance_path: path.clone(),
                                component: component.to_string(),
                                variables: variables.clone(),
                            });
                            true
                        }
                        None => imports.len() != before,
                    };
                    if imports.is_empty() {
                        instance.imports.remove(component);
                    }
                    changed.then(|| (importer, instance.status))
                })
                .collect()
        };

        debug!(
            app = %managed.name(),
            exporter = %path,
            component,
            importers = updated.len(),
            added = variables.is_some(),
            "Imports updated"
        );
        for (importer, status) in updated {
            self.manager.notify(DmEvent::instance(
                EventKind::Changed,
                managed.name(),
                &importer,
                status,
            ));
        }
        self.manager.persist(managed).await;
        Ok(())
    }
}

fn not_found(managed: &ManagedApplication, path: &InstancePath) -> DmError {
    DmError::InstanceNotFound {
        application: managed.name().to_string(),
        path: path.clone(),
    }
}
