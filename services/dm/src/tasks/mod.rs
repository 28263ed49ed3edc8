//! Periodic background checks.
//!
//! - [`MessageChecker`] retries the flush of every non-empty outbound queue.
//! - [`HeartbeatChecker`] marks started machines whose agent went silent.

mod heartbeat_checker;
mod message_checker;

pub use heartbeat_checker::HeartbeatChecker;
pub use message_checker::{FlushStats, MessageChecker};
