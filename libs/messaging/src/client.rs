//! Channel abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use convoy_id::ChannelId;
use tokio::sync::mpsc;
use tracing::warn;

use crate::envelope::Envelope;
use crate::error::MessagingError;
use crate::memory::InMemoryBus;
use crate::types::Message;

/// Messaging type served by [`InMemoryBus`].
pub const MESSAGING_TYPE_IN_MEMORY: &str = "in-memory";

/// A client of the message bus.
///
/// Delivery is ordered per channel and at-least-once. A successful `send`
/// means the transport accepted the message, not that it was processed.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Name of the messaging implementation.
    fn messaging_type(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn send(&self, channel: &ChannelId, message: &Message) -> Result<(), MessagingError>;

    /// Starts receiving the messages of a channel.
    async fn subscribe(&self, channel: &ChannelId) -> Result<Subscription, MessagingError>;

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), MessagingError>;
}

/// Receiving end of a channel subscription.
#[derive(Debug)]
pub struct Subscription {
    channel: ChannelId,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(channel: ChannelId, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { channel, rx }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Waits for the next decodable envelope.
    ///
    /// Frames that fail to decode are logged and skipped. Returns `None`
    /// once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let bytes = self.rx.recv().await?;
            match Envelope::decode(&bytes) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Dropping undecodable message");
                }
            }
        }
    }
}

/// Builds a client for the configured messaging type.
pub fn client_for(messaging_type: &str) -> Result<Arc<dyn MessagingClient>, MessagingError> {
    match messaging_type {
        MESSAGING_TYPE_IN_MEMORY => Ok(Arc::new(InMemoryBus::new())),
        other => Err(MessagingError::UnsupportedType(other.to_owned())),
    }
}
