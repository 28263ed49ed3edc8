//! Error types for messages and transports.

use convoy_id::ChannelId;
use thiserror::Error;

/// Errors that can occur when encoding or decoding messages.
#[derive(Debug, Error, Clone)]
pub enum MessageError {
    /// The message type tag is unknown.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The payload does not match its type.
    #[error("invalid message payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() {
            let text = err.to_string();
            if text.starts_with("unknown variant") {
                return MessageError::UnknownMessageType(text);
            }
            return MessageError::InvalidPayload(text);
        }
        MessageError::Serialization(err.to_string())
    }
}

/// Transport-level failures.
///
/// These never reach callers of lifecycle operations: they are absorbed by
/// the outbound queues and retried later.
#[derive(Debug, Error, Clone)]
pub enum MessagingError {
    /// The client is not connected to the messaging server.
    #[error("not connected to the messaging server")]
    Disconnected,

    /// A send to the given channel failed.
    #[error("failed to send to {channel}: {reason}")]
    SendFailed { channel: ChannelId, reason: String },

    /// The channel already has a subscriber.
    #[error("channel {0} already has a subscriber")]
    AlreadySubscribed(ChannelId),

    /// The requested messaging type has no implementation.
    #[error("unsupported messaging type: {0}")]
    UnsupportedType(String),

    #[error(transparent)]
    Message(#[from] MessageError),
}

impl MessagingError {
    /// Returns true if retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected | Self::SendFailed { .. })
    }
}
