//! In-memory target handler.
//!
//! Machines are entries in a table. When built [`InMemoryTarget::with_agents`],
//! every machine also runs an agent inside this process, wired to the
//! manager's messaging client: it applies the DM's commands and sends
//! heartbeats like the agent of a real machine would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use convoy_agent::config::DEFAULT_HEARTBEAT_INTERVAL_SECS;
use convoy_agent::{heartbeat, AgentProcessor, Config as AgentConfig, LoggerPlugin, PluginRegistry};
use convoy_id::ChannelId;
use convoy_messaging::MessagingClient;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{MachineRequest, TargetError, TargetHandler, TargetProperties};

pub const IN_MEMORY_TARGET_ID: &str = "in-memory";

/// Agent tasks of one in-memory machine. Dropping it stops them.
struct RunningAgent {
    channel: ChannelId,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningAgent {
    /// Stops the agent without letting it finish its current message.
    fn abort(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for RunningAgent {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct Machine {
    request: MachineRequest,
    agent: Option<RunningAgent>,
}

/// In-memory target for testing and development.
pub struct InMemoryTarget {
    /// Counter for generating machine IDs.
    machine_counter: AtomicU64,

    /// Running machines by id.
    machines: Mutex<HashMap<String, Machine>>,

    /// Client given to the agents of new machines, if they get one.
    agent_client: Option<Arc<dyn MessagingClient>>,

    heartbeat_interval_secs: u64,

    /// Whether machine creations should fail.
    fail_creations: AtomicBool,

    /// Whether machine terminations should fail.
    fail_terminations: AtomicBool,
}

impl InMemoryTarget {
    /// A target whose machines have no agent.
    pub fn new() -> Self {
        Self {
            machine_counter: AtomicU64::new(0),
            machines: Mutex::new(HashMap::new()),
            agent_client: None,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            fail_creations: AtomicBool::new(false),
            fail_terminations: AtomicBool::new(false),
        }
    }

    /// Runs an agent on every machine created from now on, talking through
    /// `client`.
    pub fn with_agents(mut self, client: Arc<dyn MessagingClient>) -> Self {
        self.agent_client = Some(client);
        self
    }

    pub fn with_heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Makes subsequent creations fail (or succeed again).
    pub fn fail_creations(&self, fail: bool) {
        self.fail_creations.store(fail, Ordering::SeqCst);
    }

    pub fn fail_terminations(&self, fail: bool) {
        self.fail_terminations.store(fail, Ordering::SeqCst);
    }

    /// Simulates a machine dying behind the manager's back.
    pub fn kill(&self, machine_id: &str) -> bool {
        let Some(machine) = self.lock().remove(machine_id) else {
            return false;
        };
        if let Some(agent) = machine.agent {
            agent.abort();
        }
        true
    }

    pub fn running_machines(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// True if the machine runs an agent.
    pub fn has_agent(&self, machine_id: &str) -> bool {
        self.lock()
            .get(machine_id)
            .is_some_and(|machine| machine.agent.is_some())
    }

    /// Number of machines ever created.
    pub fn created_count(&self) -> u64 {
        self.machine_counter.load(Ordering::SeqCst)
    }

    fn next_machine_id(&self) -> String {
        let counter = self.machine_counter.fetch_add(1, Ordering::SeqCst);
        format!("mem_{:08x}", counter)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Machine>> {
        self.machines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn launch_agent(
        &self,
        client: Arc<dyn MessagingClient>,
        request: &MachineRequest,
    ) -> Result<RunningAgent, TargetError> {
        let config = AgentConfig {
            application: request.application.clone(),
            scoped_instance: request.scoped_instance.clone(),
            messaging_type: client.messaging_type().to_string(),
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            ip_address: None,
            log_level: "info".to_string(),
        };

        let plugins = PluginRegistry::new().with_fallback(Arc::new(LoggerPlugin::new()));
        let processor = AgentProcessor::new(
            request.application.clone(),
            request.scoped_instance.clone(),
            client.clone(),
            plugins,
        );
        let channel = processor.channel();
        let subscription = client.subscribe(&channel).await.map_err(|e| {
            TargetError::Backend(format!(
                "cannot start the agent of {}: {e}",
                request.scoped_instance
            ))
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let processor_task = tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { processor.run(subscription, shutdown_rx).await }
        });
        let heartbeat_task = tokio::spawn(async move {
            if let Err(e) = heartbeat::run_heartbeat_loop(config, client, shutdown_rx).await {
                error!(error = %e, "In-memory agent heartbeat loop failed");
            }
        });

        Ok(RunningAgent {
            channel,
            shutdown,
            tasks: vec![processor_task, heartbeat_task],
        })
    }
}

impl Default for InMemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetHandler for InMemoryTarget {
    fn target_id(&self) -> &str {
        IN_MEMORY_TARGET_ID
    }

    async fn create_machine(&self, request: &MachineRequest) -> Result<String, TargetError> {
        if self.fail_creations.load(Ordering::SeqCst) {
            return Err(TargetError::Backend(
                "in-memory target configured to fail".to_string(),
            ));
        }

        let agent = match &self.agent_client {
            Some(client) => Some(self.launch_agent(client.clone(), request).await?),
            None => None,
        };

        let machine_id = self.next_machine_id();
        info!(
            application = %request.application,
            instance = %request.scoped_instance,
            machine_id = %machine_id,
            with_agent = agent.is_some(),
            "Created in-memory machine"
        );
        self.lock().insert(
            machine_id.clone(),
            Machine {
                request: request.clone(),
                agent,
            },
        );
        Ok(machine_id)
    }

    async fn is_machine_running(
        &self,
        _properties: &TargetProperties,
        machine_id: &str,
    ) -> Result<bool, TargetError> {
        Ok(self.lock().contains_key(machine_id))
    }

    async fn terminate_machine(
        &self,
        _properties: &TargetProperties,
        machine_id: &str,
    ) -> Result<(), TargetError> {
        if self.fail_terminations.load(Ordering::SeqCst) {
            return Err(TargetError::Backend(format!(
                "cannot terminate {machine_id}"
            )));
        }

        let removed = self.lock().remove(machine_id);
        let Some(machine) = removed else {
            debug!(machine_id, "Machine already gone");
            return Ok(());
        };

        info!(
            instance = %machine.request.scoped_instance,
            machine_id,
            "Terminated in-memory machine"
        );
        if let (Some(agent), Some(client)) = (machine.agent, &self.agent_client) {
            let channel = agent.channel.clone();
            drop(agent);
            if let Err(e) = client.unsubscribe(&channel).await {
                warn!(channel = %channel, error = %e, "Cannot close the agent channel");
            }
        }
        Ok(())
    }
}
