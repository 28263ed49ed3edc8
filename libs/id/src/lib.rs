//! # convoy-id
//!
//! Identifier types shared by the deployment manager and its agents.
//!
//! ## Design Principles
//!
//! - Identifiers have a canonical string representation with strict parsing
//! - Parsing and formatting round-trip (parse → format → parse)
//! - Types prevent mixing instance paths, channel names and message IDs
//!
//! ## Formats
//!
//! - Instance paths: `/vm1/tomcat/war`, one segment per tree level
//! - Message IDs: `msg_{ulid}`, time-ordered and unique
//! - Channels: `agent:{application}:{scoped instance path}` or `dm:{application}`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
