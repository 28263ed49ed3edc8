//! convoy deployment manager library.
//!
//! This crate primarily ships a `dm` binary, but the manager itself is a
//! library so that agents, tests and embedding tools can drive it.

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod managed;
pub mod manager;
pub mod processor;
pub mod queue;
pub mod store;
pub mod targets;
pub mod tasks;

pub use config::Config;
pub use error::DmError;
pub use events::{DmEvent, DmListener, EventKind};
pub use managed::ManagedApplication;
pub use manager::Manager;
