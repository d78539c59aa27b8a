//! On-disk storage for ledger pages.
//!
//! A [`Database`] is one SQLite file holding every page of a ledger: the
//! page registry, the commit DAG and each commit's change list. Opening it
//! brings the schema up to date, so a handle is always ready for the typed
//! queries in [`queries`].

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// Commit store of a ledger, backed by a single SQLite connection.
///
/// Page loops append from their own tasks, so the connection sits behind a
/// `Mutex`; every query holds it for one statement or one transaction.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the ledger database at `path`, creating it if needed, and apply
    /// any pending migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening ledger database");

        let conn = Connection::open(path)?;
        // Page loops read while others append.
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        Self::prepare(conn)
    }

    /// A ledger database that lives only as long as the handle.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, DatabaseError> {
        // Deleting a page cascades to its commits and their changes.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::run_migrations(&conn)?;
        debug!(
            version = schema::get_schema_version(&conn)?,
            "ledger schema ready"
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Version of the schema the database is at.
    pub fn schema_version(&self) -> Result<u32, DatabaseError> {
        schema::get_schema_version(&self.conn())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("ledger database lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in one SQLite transaction; an `Err` rolls everything back.
    pub(crate) fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
