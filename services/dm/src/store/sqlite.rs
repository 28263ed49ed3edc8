//! SQLite-backed instance store.
//!
//! One row per application holding its root instances as JSON, so that a
//! restarted manager finds its trees, statuses and machine ids again.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use convoy_model::{Application, Instance};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{InstanceStore, StoreError};

pub struct SqliteInstanceStore {
    conn: Mutex<Connection>,
}

impl SqliteInstanceStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instance_trees (
                application TEXT PRIMARY KEY,
                qualifier TEXT NOT NULL,
                roots TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        debug!("Instance store schema initialized");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Names of the applications with a saved tree.
    pub fn applications(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT application FROM instance_trees ORDER BY application")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }
}

impl InstanceStore for SqliteInstanceStore {
    fn save(&self, application: &Application) -> Result<(), StoreError> {
        let roots = serde_json::to_string(&application.root_instances)?;
        let now = chrono::Utc::now().to_rfc3339();

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            r#"
            INSERT INTO instance_trees (application, qualifier, roots, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(application) DO UPDATE SET
                qualifier = excluded.qualifier,
                roots = excluded.roots,
                updated_at = excluded.updated_at
            "#,
            params![application.name, application.qualifier, roots, now],
        )?;

        debug!(app = %application.name, "Saved instance tree");
        Ok(())
    }

    fn load(&self, application: &str) -> Result<Option<Vec<Instance>>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let raw: Option<String> = conn
            .query_row(
                "SELECT roots FROM instance_trees WHERE application = ?1",
                params![application],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|source| StoreError::Corrupted {
                application: application.to_string(),
                source,
            })
        })
        .transpose()
    }

    fn delete(&self, application: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "DELETE FROM instance_trees WHERE application = ?1",
            params![application],
        )?;
        Ok(())
    }
}
