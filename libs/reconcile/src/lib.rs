//! Reconciliation primitives.
//!
//! The deployment manager never waits for agents. Staleness and lost
//! deliveries are only discovered by periodic tasks, and this library holds
//! the bookkeeping those tasks share:
//!
//! - [`LivenessTracker`]: when each agent was last heard from, and whether
//!   it has been silent for longer than a grace period.
//! - [`RetryTracker`]: how many times a resource failed within a window,
//!   so that repeated failures can be reported louder than the first one.
//!
//! # Invariants
//!
//! - Trackers never sleep or spawn; callers supply the clock tick.
//! - All instants come from `tokio::time`, so paused-clock tests drive them.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Liveness of a tracked resource at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Heard from within the grace period.
    Alive,

    /// Silent for longer than the grace period.
    Expired { silent_for: Duration },

    /// Never heard from.
    Unknown,
}

impl Liveness {
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }
}

/// Tracks the last time each resource showed signs of life.
#[derive(Debug, Clone)]
pub struct LivenessTracker<K> {
    grace: Duration,
    last_seen: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> LivenessTracker<K> {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            last_seen: HashMap::new(),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Record a sign of life now.
    pub fn record(&mut self, key: K) {
        self.record_at(key, Instant::now());
    }

    /// Record a sign of life at `at`. Older instants never move the mark back.
    pub fn record_at(&mut self, key: K, at: Instant) {
        self.last_seen
            .entry(key)
            .and_modify(|seen| {
                if at > *seen {
                    *seen = at;
                }
            })
            .or_insert(at);
    }

    /// Stop tracking a resource.
    pub fn forget(&mut self, key: &K) {
        self.last_seen.remove(key);
    }

    pub fn last_seen(&self, key: &K) -> Option<Instant> {
        self.last_seen.get(key).copied()
    }

    /// Liveness of `key` as observed at `now`.
    pub fn check(&self, key: &K, now: Instant) -> Liveness {
        let Some(seen) = self.last_seen.get(key) else {
            return Liveness::Unknown;
        };

        let silent_for = now.saturating_duration_since(*seen);
        if silent_for > self.grace {
            Liveness::Expired { silent_for }
        } else {
            Liveness::Alive
        }
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Number of failures recorded for a resource in the current window.
    pub fn failures(&self, resource_key: &str) -> u32 {
        match self.failures.get(resource_key) {
            Some((count, first)) if first.elapsed() <= self.window => *count,
            _ => 0,
        }
    }

    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        self.failures(resource_key) > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    ///
    /// Returns true if the resource had failures recorded.
    pub fn clear(&mut self, resource_key: &str) -> bool {
        self.failures.remove(resource_key).is_some()
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default interval of the message checker.
pub const DEFAULT_MESSAGE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Default interval of the heartbeat checker.
pub const DEFAULT_HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Default silence allowed before an agent is considered lost.
pub const DEFAULT_HEARTBEAT_GRACE: Duration = Duration::from_secs(3 * 60);

/// Default retry limit per target before failures are escalated.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
