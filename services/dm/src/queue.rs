//! Per-target outbound queues.
//!
//! Every command for an agent is appended to the queue of its scoped
//! instance before any send is attempted. Flushing hands messages to the
//! transport front to back and removes each one only once the transport
//! accepted it, so a failed flush leaves exactly the unsent suffix behind.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use convoy_id::{ChannelId, InstancePath};
use convoy_messaging::{Message, MessagingClient, MessagingError};
use tracing::{debug, warn};

/// Undelivered messages of one application, keyed by scoped instance.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: Mutex<BTreeMap<InstancePath, VecDeque<Message>>>,
}

/// Outcome of a flush that stopped on a transport error.
#[derive(Debug)]
pub struct FlushError {
    /// Messages handed off before the failure.
    pub sent: usize,
    pub source: MessagingError,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message for `scope`. Never blocks on I/O.
    pub fn enqueue(&self, scope: &InstancePath, message: Message) {
        self.lock()
            .entry(scope.clone())
            .or_default()
            .push_back(message);
    }

    pub fn len(&self, scope: &InstancePath) -> usize {
        self.lock().get(scope).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values().all(VecDeque::is_empty)
    }

    /// Copy of the messages waiting for `scope`, oldest first.
    pub fn pending(&self, scope: &InstancePath) -> Vec<Message> {
        self.lock()
            .get(scope)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Scoped instances with at least one waiting message.
    pub fn pending_scopes(&self) -> Vec<InstancePath> {
        self.lock()
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(scope, _)| scope.clone())
            .collect()
    }

    /// Drops everything waiting for `scope`. Returns the number of messages dropped.
    pub fn discard(&self, scope: &InstancePath) -> usize {
        self.lock().remove(scope).map_or(0, |q| q.len())
    }

    fn front(&self, scope: &InstancePath) -> Option<Message> {
        self.lock().get(scope).and_then(|q| q.front().cloned())
    }

    fn pop_front(&self, scope: &InstancePath) {
        let mut pending = self.lock();
        if let Some(q) = pending.get_mut(scope) {
            q.pop_front();
            if q.is_empty() {
                pending.remove(scope);
            }
        }
    }

    /// Sends the messages of `scope` to `channel` in order.
    ///
    /// Callers serialize flushes of the same queue: the front message is
    /// only removed after `client` accepted it.
    pub async fn flush_to(
        &self,
        scope: &InstancePath,
        client: &dyn MessagingClient,
        channel: &ChannelId,
    ) -> Result<usize, FlushError> {
        let mut sent = 0;
        while let Some(message) = self.front(scope) {
            if let Err(source) = client.send(channel, &message).await {
                warn!(
                    instance = %scope,
                    channel = %channel,
                    sent,
                    remaining = self.len(scope),
                    error = %source,
                    "Flush interrupted"
                );
                return Err(FlushError { sent, source });
            }
            self.pop_front(scope);
            sent += 1;
        }

        if sent > 0 {
            debug!(instance = %scope, channel = %channel, sent, "Flushed queued messages");
        }
        Ok(sent)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<InstancePath, VecDeque<Message>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
