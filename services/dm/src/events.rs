//! Notifications sent to DM listeners.

use std::sync::{Arc, PoisonError, RwLock};

use convoy_id::InstancePath;
use convoy_model::InstanceStatus;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Changed,
    Deleted,
}

/// Something observable happened in the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmEvent {
    Application {
        kind: EventKind,
        name: String,
    },
    Instance {
        kind: EventKind,
        application: String,
        path: InstancePath,
        status: InstanceStatus,
    },
    /// Text of an echo message, for debugging listeners.
    Raw {
        application: Option<String>,
        content: String,
    },
}

impl DmEvent {
    pub fn instance(
        kind: EventKind,
        application: &str,
        path: &InstancePath,
        status: InstanceStatus,
    ) -> Self {
        Self::Instance {
            kind,
            application: application.to_string(),
            path: path.clone(),
            status,
        }
    }
}

/// Receives DM events.
///
/// Called inline from the thread that produced the event: implementations
/// must return quickly.
pub trait DmListener: Send + Sync {
    fn listener_id(&self) -> &str;

    fn on_event(&self, event: &DmEvent);
}

/// The registered listeners.
#[derive(Default)]
pub struct Listeners {
    inner: RwLock<Vec<Arc<dyn DmListener>>>,
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn DmListener>) {
        debug!(listener = listener.listener_id(), "Listener added");
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Removes every listener with the given id. Returns true if one was found.
    pub fn remove(&self, listener_id: &str) -> bool {
        let mut listeners = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| l.listener_id() != listener_id);
        let removed = listeners.len() != before;
        if removed {
            debug!(listener = listener_id, "Listener removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to a snapshot of the listeners.
    pub fn notify(&self, event: &DmEvent) {
        let snapshot: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in snapshot {
            listener.on_event(event);
        }
    }
}
