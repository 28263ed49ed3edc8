//! In-process message bus.
//!
//! Channels behave like durable queues: messages sent before anyone
//! subscribes are kept and handed over, in order, to the first subscriber.
//! Disconnecting the bus makes every send fail until it is reconnected,
//! which is how transport outages are simulated.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use convoy_id::ChannelId;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::client::{MessagingClient, Subscription, MESSAGING_TYPE_IN_MEMORY};
use crate::envelope::Envelope;
use crate::error::MessagingError;
use crate::types::Message;

#[derive(Default)]
struct ChannelSlot {
    backlog: VecDeque<Vec<u8>>,
    subscriber: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct BusInner {
    connected: AtomicBool,
    channels: Mutex<HashMap<ChannelId, ChannelSlot>>,
}

/// Shared in-memory bus. Clones talk to the same channels.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let inner = BusInner::default();
        inner.connected.store(true, Ordering::SeqCst);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Simulates the loss or recovery of the messaging server.
    pub fn set_connected(&self, connected: bool) {
        let was = self.inner.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            info!(connected, "In-memory bus connection changed");
        }
    }

    /// Number of messages waiting for a subscriber on `channel`.
    pub fn backlog_len(&self, channel: &ChannelId) -> usize {
        self.lock()
            .get(channel)
            .map(|slot| slot.backlog.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, ChannelSlot>> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagingClient for InMemoryBus {
    fn messaging_type(&self) -> &str {
        MESSAGING_TYPE_IN_MEMORY
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, channel: &ChannelId, message: &Message) -> Result<(), MessagingError> {
        if !self.is_connected() {
            return Err(MessagingError::Disconnected);
        }

        let bytes = Envelope::new(message.clone()).encode()?;
        let mut channels = self.lock();
        let slot = channels.entry(channel.clone()).or_default();

        let bytes = match &slot.subscriber {
            Some(tx) => match tx.send(bytes) {
                Ok(()) => {
                    debug!(channel = %channel, message_type = message.message_type(), "Delivered message");
                    return Ok(());
                }
                // Receiver dropped: keep the message for the next subscriber.
                Err(mpsc::error::SendError(bytes)) => {
                    slot.subscriber = None;
                    bytes
                }
            },
            None => bytes,
        };

        debug!(channel = %channel, message_type = message.message_type(), "Queued message without subscriber");
        slot.backlog.push_back(bytes);
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<Subscription, MessagingError> {
        let mut channels = self.lock();
        let slot = channels.entry(channel.clone()).or_default();

        if slot.subscriber.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(MessagingError::AlreadySubscribed(channel.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(bytes) = slot.backlog.pop_front() {
            // Cannot fail: we hold the receiver.
            let _ = tx.send(bytes);
        }
        slot.subscriber = Some(tx);

        debug!(channel = %channel, "Subscribed");
        Ok(Subscription::new(channel.clone(), rx))
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), MessagingError> {
        if let Some(slot) = self.lock().get_mut(channel) {
            slot.subscriber = None;
        }
        debug!(channel = %channel, "Unsubscribed");
        Ok(())
    }
}
