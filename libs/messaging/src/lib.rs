//! # convoy-messaging
//!
//! Messages exchanged between the deployment manager (DM) and its agents,
//! and the channel abstraction carrying them.
//!
//! ## Design Principles
//!
//! - Messages are typed records; the type tag survives the wire
//! - Every message travels inside an envelope carrying a unique ID
//! - Channels are logical: one per scoped instance (DM → agent) and one per
//!   application (agents → DM)
//! - The transport is ordered per channel and at-least-once; callers that
//!   need retries keep their own queues
//!
//! ## Message Kinds
//!
//! - Commands (`DM → agent`): state changes, resynchronization, removals
//! - Notifications (`agent → DM`): heartbeats, status changes, exports,
//!   machine-down reports
//! - Echo messages in both directions, for debugging

mod client;
mod envelope;
mod error;
mod memory;
mod types;

pub use client::{client_for, MessagingClient, Subscription, MESSAGING_TYPE_IN_MEMORY};
pub use envelope::Envelope;
pub use error::{MessageError, MessagingError};
pub use memory::InMemoryBus;
pub use types::*;
