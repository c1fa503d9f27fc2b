//! Persistence layer.
//!
//! SQLite-backed store for machine rows and settings. Machine rows are
//! written whole (serialized record JSON plus queryable name column); the
//! manager never does partial row updates.

mod machines;
mod schema;

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use warden_shared::{WardenError, WardenResult};

pub use machines::settings as machines_settings;
pub use machines::{MachineRecord, MachineStore};

/// Helper macro to convert rusqlite errors to WardenError.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| WardenError::Store(e.to_string()))
    };
}

pub(crate) use db_err;

/// SQLite database handle.
///
/// Thread-safe via `parking_lot::Mutex`; domain stores wrap this to provide
/// their APIs.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database.
    ///
    /// WAL for concurrent reads, FULL sync so every committed row survives a
    /// crash, which the restore path depends on.
    pub fn open(db_path: &Path) -> WardenResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;

        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=100000;
            "
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(conn: &Connection) -> WardenResult<()> {
        for sql in schema::all_schemas() {
            db_err!(conn.execute_batch(sql))?;
        }

        let current_version: Option<i32> = db_err!(
            conn.query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
        )?;

        match current_version {
            None => {
                db_err!(conn.execute(
                    "INSERT INTO schema_version (id, version) VALUES (1, ?1)",
                    rusqlite::params![schema::SCHEMA_VERSION],
                ))?;
                tracing::info!(version = schema::SCHEMA_VERSION, "initialized store schema");
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(WardenError::Store(format!(
                    "store schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }
}
