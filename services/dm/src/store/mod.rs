//! Durable storage of instance trees.
//!
//! The manager saves an application's instances after every structural
//! change and reloads them when the application is registered again.

mod sqlite;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use convoy_model::{Application, Instance};
use thiserror::Error;

pub use sqlite::SqliteInstanceStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored instances for {application}: {source}")]
    Corrupted {
        application: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Saves and restores instance trees, keyed by application name.
pub trait InstanceStore: Send + Sync {
    fn save(&self, application: &Application) -> Result<(), StoreError>;

    /// The saved root instances of an application, if any.
    fn load(&self, application: &str) -> Result<Option<Vec<Instance>>, StoreError>;

    fn delete(&self, application: &str) -> Result<(), StoreError>;
}

/// Store keeping trees in process memory.
#[derive(Default)]
pub struct MemoryInstanceStore {
    trees: Mutex<HashMap<String, Vec<Instance>>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceStore for MemoryInstanceStore {
    fn save(&self, application: &Application) -> Result<(), StoreError> {
        self.trees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(application.name.clone(), application.root_instances.clone());
        Ok(())
    }

    fn load(&self, application: &str) -> Result<Option<Vec<Instance>>, StoreError> {
        Ok(self
            .trees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(application)
            .cloned())
    }

    fn delete(&self, application: &str) -> Result<(), StoreError> {
        self.trees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(application);
        Ok(())
    }
}
