//! Detection of silent agents.

use std::time::Duration;

use convoy_id::InstancePath;
use convoy_model::InstanceStatus;
use convoy_reconcile::Liveness;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::events::{DmEvent, EventKind};
use crate::managed::ManagedApplication;
use crate::manager::Manager;

pub struct HeartbeatChecker {
    manager: Manager,
    interval: Duration,
}

impl HeartbeatChecker {
    pub fn new(manager: Manager, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Runs until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting heartbeat checker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let marked = self.check_once().await;
                    if marked > 0 {
                        info!(marked, "Heartbeat check complete");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Marks every started scoped instance whose agent is silent past the
    /// grace period. Returns the number of instances marked.
    pub async fn check_once(&self) -> usize {
        let mut marked = 0;
        for managed in self.manager.applications() {
            let before = marked;
            let started: Vec<_> = {
                let model = managed.model.read().await;
                model
                    .scoped_paths()
                    .into_iter()
                    .filter(|scope| model.status_of(scope) == Some(InstanceStatus::DeployedStarted))
                    .collect()
            };

            for scope in started {
                match managed.liveness(&scope, Instant::now()) {
                    Liveness::Alive => {}
                    Liveness::Unknown => {
                        // Restored or never heard of: the grace period starts now.
                        managed.record_heartbeat(&scope);
                    }
                    Liveness::Expired { silent_for } => {
                        if self.mark_problem(&managed, &scope, silent_for).await {
                            marked += 1;
                        }
                    }
                }
            }

            if marked > before {
                self.manager.persist(&managed).await;
            }
        }
        marked
    }

    async fn mark_problem(
        &self,
        managed: &ManagedApplication,
        scope: &InstancePath,
        silent_for: Duration,
    ) -> bool {
        {
            let mut model = managed.model.write().await;
            // A heartbeat or a state change may have come in meanwhile.
            if model.status_of(scope) != Some(InstanceStatus::DeployedStarted)
                || !managed.liveness(scope, Instant::now()).is_expired()
            {
                debug!(instance = %scope, "Agent recovered before being marked");
                return false;
            }
            let Some(instance) = model.find_mut(scope) else {
                return false;
            };
            instance.reset_status(InstanceStatus::Problem);
        }

        warn!(
            app = %managed.name(),
            instance = %scope,
            silent_secs = silent_for.as_secs(),
            "No heartbeat within the grace period"
        );
        self.manager.notify(DmEvent::instance(
            EventKind::Changed,
            managed.name(),
            scope,
            InstanceStatus::Problem,
        ));
        true
    }
}
