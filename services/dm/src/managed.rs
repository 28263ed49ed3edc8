//! Applications under management.

use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use convoy_id::InstancePath;
use convoy_model::{Application, InstanceStatus};
use convoy_reconcile::{Liveness, LivenessTracker};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::queue::OutboundQueue;
use crate::targets::TargetProperties;

/// An application plus the runtime state the manager keeps for it.
///
/// Lock order: `ops`, then `model`, `flush_lock` or `persist_lock`. The
/// model lock is never held across target handler calls, sends or saves.
pub struct ManagedApplication {
    name: String,

    /// Serializes lifecycle walks and structural changes.
    pub(crate) ops: Mutex<()>,

    pub(crate) model: RwLock<Application>,

    queue: OutboundQueue,

    /// Serializes flushes of this application's queues.
    pub(crate) flush_lock: Mutex<()>,

    /// Serializes saves of this application's instances.
    pub(crate) persist_lock: Mutex<()>,

    liveness: StdMutex<LivenessTracker<InstancePath>>,

    target_properties: TargetProperties,
}

impl ManagedApplication {
    pub fn new(
        application: Application,
        target_properties: TargetProperties,
        heartbeat_grace: Duration,
    ) -> Self {
        Self {
            name: application.name.clone(),
            ops: Mutex::new(()),
            model: RwLock::new(application),
            queue: OutboundQueue::new(),
            flush_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
            liveness: StdMutex::new(LivenessTracker::new(heartbeat_grace)),
            target_properties,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_properties(&self) -> &TargetProperties {
        &self.target_properties
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Copy of the current model. Statuses may be transient.
    pub async fn snapshot(&self) -> Application {
        self.model.read().await.clone()
    }

    pub async fn status_of(&self, path: &InstancePath) -> Option<InstanceStatus> {
        self.model.read().await.status_of(path)
    }

    /// Records a sign of life from the agent of `scope`.
    pub fn record_heartbeat(&self, scope: &InstancePath) {
        self.liveness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(scope.clone());
    }

    pub(crate) fn forget_liveness(&self, scope: &InstancePath) {
        self.liveness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forget(scope);
    }

    pub(crate) fn liveness(&self, scope: &InstancePath, now: Instant) -> Liveness {
        self.liveness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check(scope, now)
    }
}
