//! Message envelope - the wire wrapper for all messages.

use chrono::{DateTime, Utc};
use convoy_id::MessageId;
use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::types::Message;

/// Wire format of a message.
///
/// ```json
/// {"id":"msg_01HV...","sent_at":"2026-01-01T00:00:00Z","message":{"type":"heartbeat",...}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message identifier, used for deduplication and tracing.
    pub id: MessageId,

    /// When the message was handed to the transport.
    pub sent_at: DateTime<Utc>,

    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            id: MessageId::new(),
            sent_at: Utc::now(),
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
