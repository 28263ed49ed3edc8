//! The deployment manager context.
//!
//! A [`Manager`] owns the application registry, the messaging client, the
//! target handlers and the listeners. It is cheap to clone: every clone
//! shares the same state, which is how the background tasks and message
//! processors reach it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use convoy_id::{ChannelId, InstancePath};
use convoy_messaging::{client_for, Message, MessagingClient};
use convoy_model::{Application, Instance, InstanceStatus, ModelError, DATA_IP_ADDRESS, DATA_MACHINE_ID};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::DmError;
use crate::events::{DmEvent, DmListener, EventKind, Listeners};
use crate::managed::ManagedApplication;
use crate::processor::DmProcessor;
use crate::queue::FlushError;
use crate::store::InstanceStore;
use crate::targets::{TargetHandler, TargetProperties, TargetRegistry};
use crate::tasks::{HeartbeatChecker, MessageChecker};

/// Time given to background tasks to finish on stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Config,
    applications: RwLock<HashMap<String, Arc<ManagedApplication>>>,
    messaging: RwLock<Option<Arc<dyn MessagingClient>>>,
    targets: TargetRegistry,
    listeners: Listeners,
    store: Arc<dyn InstanceStore>,
    running: StdMutex<Option<Running>>,
}

/// Background work started by [`Manager::start`].
struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    processors: HashMap<String, JoinHandle<()>>,
}

impl Manager {
    pub fn new(config: Config, store: Arc<dyn InstanceStore>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                applications: RwLock::new(HashMap::new()),
                messaging: RwLock::new(None),
                targets: TargetRegistry::default(),
                listeners: Listeners::default(),
                store,
                running: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // =========================================================================
    // Configuration and lifecycle
    // =========================================================================

    /// Replaces the messaging client. Takes effect for subsequent operations;
    /// processors already running keep their subscriptions until restart.
    pub fn set_messaging_client(&self, client: Option<Arc<dyn MessagingClient>>) {
        match &client {
            Some(c) => info!(messaging_type = c.messaging_type(), "Messaging client configured"),
            None => warn!("Messaging client removed"),
        }
        *self
            .inner
            .messaging
            .write()
            .unwrap_or_else(PoisonError::into_inner) = client;
    }

    /// Builds and installs a client for `messaging_type`.
    ///
    /// An unknown type leaves the manager without client: operations fail
    /// with a configuration error until it is reconfigured.
    pub fn configure_messaging(&self, messaging_type: &str) -> Result<(), DmError> {
        match client_for(messaging_type) {
            Ok(client) => {
                self.set_messaging_client(Some(client));
                Ok(())
            }
            Err(e) => {
                error!(messaging_type, error = %e, "Invalid messaging configuration");
                self.set_messaging_client(None);
                Err(DmError::Configuration(e.to_string()))
            }
        }
    }

    pub fn messaging_client(&self) -> Option<Arc<dyn MessagingClient>> {
        self.inner
            .messaging
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_started(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Fails unless the manager is started with a messaging client.
    pub fn check_configuration(&self) -> Result<Arc<dyn MessagingClient>, DmError> {
        if !self.is_started() {
            warn!("The DM was not started");
            return Err(DmError::Configuration("the DM was not started".to_string()));
        }
        self.messaging_client().ok_or_else(|| {
            warn!("No valid messaging client");
            DmError::Configuration("messaging is not configured".to_string())
        })
    }

    /// Starts the periodic checkers and one message processor per application.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), DmError> {
        if self.is_started() {
            debug!("Manager already started");
            return Ok(());
        }
        let client = self
            .messaging_client()
            .ok_or_else(|| DmError::Configuration("messaging is not configured".to_string()))?;

        info!(messaging_type = client.messaging_type(), "Starting deployment manager");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut running = Running {
            shutdown: shutdown_tx,
            tasks: Vec::new(),
            processors: HashMap::new(),
        };

        let message_checker = MessageChecker::new(self.clone(), self.config().message_check_interval);
        running.tasks.push(tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move { message_checker.run(shutdown).await }
        }));

        let heartbeat_checker =
            HeartbeatChecker::new(self.clone(), self.config().heartbeat_check_interval);
        running.tasks.push(tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move { heartbeat_checker.run(shutdown).await }
        }));

        match client.subscribe(&ChannelId::Debug).await {
            Ok(subscription) => {
                let processor = DmProcessor::debug(self.clone());
                running.tasks.push(tokio::spawn({
                    let shutdown = shutdown_rx.clone();
                    async move { processor.run(subscription, shutdown).await }
                }));
            }
            Err(e) => warn!(error = %e, "Cannot listen to the debug channel"),
        }

        for name in self.application_names() {
            if let Some(handle) = self
                .spawn_processor(client.as_ref(), shutdown_rx.clone(), &name)
                .await
            {
                running.processors.insert(name, handle);
            }
        }

        *self.lock_running() = Some(running);
        info!("Deployment manager started");
        Ok(())
    }

    /// Stops the background work and waits for it to finish.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };
        info!("Stopping deployment manager");

        let _ = running.shutdown.send(true);

        if let Some(client) = self.messaging_client() {
            for name in running.processors.keys() {
                if let Err(e) = client.unsubscribe(&ChannelId::dm(name)).await {
                    warn!(app = %name, error = %e, "Cannot stop listening to agents");
                }
            }
            if let Err(e) = client.unsubscribe(&ChannelId::Debug).await {
                warn!(error = %e, "Cannot stop listening to the debug channel");
            }
        }

        let handles = running
            .tasks
            .into_iter()
            .chain(running.processors.into_values());
        for handle in handles {
            if let Err(e) = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                warn!(error = %e, "Background task did not shut down in time");
            }
        }

        info!("Deployment manager stopped");
    }

    async fn spawn_processor(
        &self,
        client: &dyn MessagingClient,
        shutdown: watch::Receiver<bool>,
        application: &str,
    ) -> Option<JoinHandle<()>> {
        match client.subscribe(&ChannelId::dm(application)).await {
            Ok(subscription) => {
                let processor = DmProcessor::for_application(self.clone(), application);
                Some(tokio::spawn(async move {
                    processor.run(subscription, shutdown).await
                }))
            }
            Err(e) => {
                error!(app = %application, error = %e, "Cannot listen to agent messages");
                None
            }
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Registries
    // =========================================================================

    pub fn targets(&self) -> &TargetRegistry {
        &self.inner.targets
    }

    pub fn register_target(&self, handler: Arc<dyn TargetHandler>) {
        self.inner.targets.register(handler);
    }

    pub fn unregister_target(&self, target_id: &str) {
        self.inner.targets.unregister(target_id);
    }

    pub fn add_listener(&self, listener: Arc<dyn DmListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener_id: &str) -> bool {
        self.inner.listeners.remove(listener_id)
    }

    pub(crate) fn notify(&self, event: DmEvent) {
        self.inner.listeners.notify(&event);
    }

    // =========================================================================
    // Applications
    // =========================================================================

    /// Registers an application.
    ///
    /// If the store holds instances saved under the same name, they replace
    /// the application's instances, statuses included.
    #[instrument(skip(self, application, target_properties), fields(app = %application.name))]
    pub async fn create_application(
        &self,
        mut application: Application,
        target_properties: TargetProperties,
    ) -> Result<Arc<ManagedApplication>, DmError> {
        let name = application.name.clone();
        if self.find_application(&name).is_some() {
            return Err(DmError::AlreadyExisting(name));
        }

        if let Some(roots) = self.inner.store.load(&name)? {
            info!(instances = roots.len(), "Restored saved instances");
            application.root_instances = roots;
        }

        let managed = Arc::new(ManagedApplication::new(
            application,
            target_properties,
            self.config().heartbeat_grace,
        ));

        {
            let mut applications = self
                .inner
                .applications
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if applications.contains_key(&name) {
                return Err(DmError::AlreadyExisting(name));
            }
            applications.insert(name.clone(), managed.clone());
        }

        let shutdown = self
            .lock_running()
            .as_ref()
            .map(|running| running.shutdown.subscribe());
        if let (Some(client), Some(shutdown)) = (self.messaging_client(), shutdown) {
            if let Some(handle) = self.spawn_processor(client.as_ref(), shutdown, &name).await {
                if let Some(running) = self.lock_running().as_mut() {
                    running.processors.insert(name.clone(), handle);
                }
            }
        }

        self.persist(&managed).await;
        self.notify(DmEvent::Application {
            kind: EventKind::Created,
            name: name.clone(),
        });
        info!("Application created");
        Ok(managed)
    }

    /// Unregisters an application whose root instances are all NOT_DEPLOYED.
    #[instrument(skip(self))]
    pub async fn delete_application(&self, name: &str) -> Result<(), DmError> {
        let managed = self.application(name)?;
        {
            let model = managed.model.read().await;
            if model
                .root_instances
                .iter()
                .any(|root| root.status != InstanceStatus::NotDeployed)
            {
                return Err(DmError::UnauthorizedAction(format!(
                    "{name} contains instances that are still deployed"
                )));
            }
        }

        self.inner
            .applications
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        let processor = self
            .lock_running()
            .as_mut()
            .and_then(|running| running.processors.remove(name));
        if let Some(handle) = processor {
            handle.abort();
        }
        if let Some(client) = self.messaging_client() {
            if let Err(e) = client.unsubscribe(&ChannelId::dm(name)).await {
                warn!(error = %e, "Cannot stop listening to agents");
            }
        }

        self.inner.store.delete(name)?;
        self.notify(DmEvent::Application {
            kind: EventKind::Deleted,
            name: name.to_string(),
        });
        info!("Application deleted");
        Ok(())
    }

    pub fn find_application(&self, name: &str) -> Option<Arc<ManagedApplication>> {
        self.inner
            .applications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn application(&self, name: &str) -> Result<Arc<ManagedApplication>, DmError> {
        self.find_application(name)
            .ok_or_else(|| DmError::ApplicationNotFound(name.to_string()))
    }

    /// Registered applications, by name.
    pub fn applications(&self) -> Vec<Arc<ManagedApplication>> {
        let mut applications: Vec<_> = self
            .inner
            .applications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        applications.sort_by(|a, b| a.name().cmp(b.name()));
        applications
    }

    fn application_names(&self) -> Vec<String> {
        self.applications()
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Inserts `instance` (with its children) under `parent`, or as a root.
    #[instrument(skip(self, instance), fields(instance = %instance.name))]
    pub async fn add_instance(
        &self,
        application: &str,
        parent: Option<&InstancePath>,
        instance: Instance,
    ) -> Result<InstancePath, DmError> {
        self.check_configuration()?;
        let managed = self.application(application)?;
        let _op = managed.ops.lock().await;

        let path = managed
            .model
            .write()
            .await
            .insert(parent, instance)
            .map_err(|e| model_error(application, e))?;

        self.persist(&managed).await;
        self.notify(DmEvent::instance(
            EventKind::Created,
            application,
            &path,
            InstanceStatus::NotDeployed,
        ));
        info!(path = %path, "Instance added");
        Ok(path)
    }

    /// Removes a subtree whose instances are all NOT_DEPLOYED.
    #[instrument(skip(self))]
    pub async fn remove_instance(&self, application: &str, path: &InstancePath) -> Result<(), DmError> {
        self.check_configuration()?;
        let managed = self.application(application)?;
        let _op = managed.ops.lock().await;

        managed
            .model
            .write()
            .await
            .remove(path)
            .map_err(|e| model_error(application, e))?;

        if path.is_root() {
            self.discard_queue(&managed, path).await;
            managed.forget_liveness(path);
        } else {
            self.send_to_scope(&managed, path, Message::RemoveInstance { path: path.clone() })
                .await;
        }

        self.persist(&managed).await;
        self.notify(DmEvent::instance(
            EventKind::Deleted,
            application,
            path,
            InstanceStatus::NotDeployed,
        ));
        info!("Instance removed");
        Ok(())
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Queues `message` for the agent managing `path`, then tries to flush.
    pub async fn send(
        &self,
        application: &str,
        path: &InstancePath,
        message: Message,
    ) -> Result<(), DmError> {
        self.check_configuration()?;
        let managed = self.application(application)?;
        if managed.status_of(path).await.is_none() {
            return Err(DmError::InstanceNotFound {
                application: application.to_string(),
                path: path.clone(),
            });
        }
        self.send_to_scope(&managed, path, message).await;
        Ok(())
    }

    /// Asks every started agent to publish its state again.
    #[instrument(skip(self))]
    pub async fn resynchronize_agents(&self, application: &str) -> Result<(), DmError> {
        self.check_configuration()?;
        let managed = self.application(application)?;

        let started: Vec<_> = {
            let model = managed.model.read().await;
            model
                .scoped_paths()
                .into_iter()
                .filter(|p| model.status_of(p) == Some(InstanceStatus::DeployedStarted))
                .collect()
        };

        debug!(agents = started.len(), "Resynchronizing agents");
        for scope in &started {
            self.send_to_scope(&managed, scope, Message::Resynchronize).await;
        }
        Ok(())
    }

    /// Sends an echo to an agent, bypassing the queue. It answers `PONG:`.
    pub async fn ping_agent(
        &self,
        application: &str,
        scope: &InstancePath,
        content: &str,
    ) -> Result<(), DmError> {
        let client = self.check_configuration()?;
        let channel = ChannelId::agent(application, scope);
        let message = Message::Echo {
            content: format!("PING:{content}"),
        };
        client.send(&channel, &message).await?;
        debug!(channel = %channel, content, "Sent ping to agent");
        Ok(())
    }

    /// Sends an echo to the manager's own debug channel.
    pub async fn ping_message_queue(&self, content: &str) -> Result<(), DmError> {
        let client = self.check_configuration()?;
        client
            .send(
                &ChannelId::Debug,
                &Message::Echo {
                    content: content.to_string(),
                },
            )
            .await?;
        debug!(content, "Sent echo on the debug channel");
        Ok(())
    }

    pub(crate) async fn send_to_scope(
        &self,
        managed: &ManagedApplication,
        path: &InstancePath,
        message: Message,
    ) {
        let scope = path.scope();
        managed.queue().enqueue(&scope, message);
        self.flush_quietly(managed, &scope).await;
    }

    /// Sends the queued messages of `scope` if its agent is up.
    ///
    /// Returns the number of messages handed to the transport. The queue is
    /// only flushed while the scoped instance is DEPLOYED_STARTED.
    pub(crate) async fn flush(
        &self,
        managed: &ManagedApplication,
        scope: &InstancePath,
    ) -> Result<usize, FlushError> {
        let Some(client) = self.messaging_client() else {
            return Err(FlushError {
                sent: 0,
                source: convoy_messaging::MessagingError::Disconnected,
            });
        };

        let _flushing = managed.flush_lock.lock().await;
        if managed.status_of(scope).await != Some(InstanceStatus::DeployedStarted) {
            return Ok(0);
        }

        let channel = ChannelId::agent(managed.name(), scope);
        managed
            .queue()
            .flush_to(scope, client.as_ref(), &channel)
            .await
    }

    /// Flush whose failures are left to the message checker.
    pub(crate) async fn flush_quietly(&self, managed: &ManagedApplication, scope: &InstancePath) {
        if let Err(e) = self.flush(managed, scope).await {
            debug!(
                app = %managed.name(),
                instance = %scope,
                sent = e.sent,
                error = %e.source,
                "Messages left for the message checker"
            );
        }
    }

    pub(crate) async fn discard_queue(&self, managed: &ManagedApplication, scope: &InstancePath) {
        let _flushing = managed.flush_lock.lock().await;
        let dropped = managed.queue().discard(scope);
        if dropped > 0 {
            info!(
                app = %managed.name(),
                instance = %scope,
                dropped,
                "Discarded messages of a terminated machine"
            );
        }
    }

    // =========================================================================
    // Model updates
    // =========================================================================

    /// Sets the status of one instance and notifies listeners if it changed.
    pub(crate) async fn set_status(
        &self,
        managed: &ManagedApplication,
        path: &InstancePath,
        status: InstanceStatus,
    ) -> Option<InstanceStatus> {
        let previous = {
            let mut model = managed.model.write().await;
            let instance = model.find_mut(path)?;
            std::mem::replace(&mut instance.status, status)
        };

        if previous != status {
            debug!(app = %managed.name(), instance = %path, from = %previous, to = %status, "Status changed");
            self.notify(DmEvent::instance(
                EventKind::Changed,
                managed.name(),
                path,
                status,
            ));
        }
        Some(previous)
    }

    /// Sets the status of every descendant of `path`, notifying each change.
    pub(crate) async fn set_descendants_status(
        &self,
        managed: &ManagedApplication,
        path: &InstancePath,
        status: InstanceStatus,
    ) {
        let changed: Vec<_> = {
            let mut model = managed.model.write().await;
            let descendants: Vec<_> = model
                .paths_preorder(Some(path))
                .into_iter()
                .filter(|p| p != path)
                .collect();
            descendants
                .into_iter()
                .filter(|p| {
                    model.find_mut(p).is_some_and(|i| {
                        let changed = i.status != status;
                        i.status = status;
                        changed
                    })
                })
                .collect()
        };

        for p in changed {
            self.notify(DmEvent::instance(EventKind::Changed, managed.name(), &p, status));
        }
    }

    /// Forgets the machine of a scoped instance.
    pub(crate) async fn clear_machine(&self, managed: &ManagedApplication, scope: &InstancePath) {
        if let Some(instance) = managed.model.write().await.find_mut(scope) {
            instance.data.remove(DATA_MACHINE_ID);
            instance.data.remove(DATA_IP_ADDRESS);
        }
        managed.forget_liveness(scope);
    }

    /// Saves the instances of an application. Failures are logged only.
    pub(crate) async fn persist(&self, managed: &ManagedApplication) {
        // Saves of one application run one at a time so the last snapshot wins.
        let _saving = managed.persist_lock.lock().await;
        let snapshot = managed.snapshot().await;
        let store = self.inner.store.clone();

        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(app = %managed.name(), error = %e, "Failed to save instances"),
            Err(e) => error!(app = %managed.name(), error = %e, "Instance save task failed"),
        }
    }
}

fn model_error(application: &str, error: ModelError) -> DmError {
    match error {
        ModelError::InstanceNotFound(path) => DmError::InstanceNotFound {
            application: application.to_string(),
            path,
        },
        ModelError::StillDeployed(path) => {
            DmError::UnauthorizedAction(format!("{path} or one of its children is still deployed"))
        }
        other => DmError::ImpossibleInsertion(other),
    }
}
