//! Outbound queue retries.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use convoy_reconcile::{RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::manager::Manager;

/// Statistics of one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub scopes: usize,
    pub sent: usize,
    pub failed: usize,
}

pub struct MessageChecker {
    manager: Manager,
    interval: Duration,
    retries: Mutex<RetryTracker>,
}

impl MessageChecker {
    pub fn new(manager: Manager, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            retries: Mutex::new(RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)),
        }
    }

    /// Runs until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting message checker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Message checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Flushes every pending queue of every application once.
    pub async fn check_once(&self) -> FlushStats {
        let mut stats = FlushStats::default();

        for managed in self.manager.applications() {
            for scope in managed.queue().pending_scopes() {
                stats.scopes += 1;
                let key = format!("{}:{}", managed.name(), scope);

                match self.manager.flush(&managed, &scope).await {
                    Ok(sent) => {
                        stats.sent += sent;
                        if self.lock().clear(&key) {
                            info!(app = %managed.name(), instance = %scope, sent, "Queue delivered after retries");
                        }
                    }
                    Err(e) => {
                        stats.sent += e.sent;
                        stats.failed += 1;
                        let (exhausted, failures) = {
                            let mut retries = self.lock();
                            let exhausted = retries.record_failure(&key);
                            (exhausted, retries.failures(&key))
                        };
                        let remaining = managed.queue().len(&scope);
                        if exhausted {
                            error!(app = %managed.name(), instance = %scope, failures, remaining, error = %e.source, "Agent unreachable, messages still queued");
                        } else {
                            warn!(app = %managed.name(), instance = %scope, failures, remaining, error = %e.source, "Failed to flush queue");
                        }
                    }
                }
            }
        }

        self.lock().prune();
        stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetryTracker> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
