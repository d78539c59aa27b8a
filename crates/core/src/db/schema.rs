//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            page_id     TEXT PRIMARY KEY,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS commits (
            page_id     TEXT    NOT NULL REFERENCES pages (page_id) ON DELETE CASCADE,
            commit_id   TEXT    NOT NULL,
            parents     TEXT    NOT NULL,
            generation  INTEGER NOT NULL,
            timestamp   TEXT    NOT NULL,
            PRIMARY KEY (page_id, commit_id)
        );

        CREATE INDEX IF NOT EXISTS idx_commits_generation ON commits (page_id, generation);

        CREATE TABLE IF NOT EXISTS commit_changes (
            page_id     TEXT    NOT NULL,
            commit_id   TEXT    NOT NULL,
            position    INTEGER NOT NULL,
            key         BLOB    NOT NULL,
            value       BLOB,
            PRIMARY KEY (page_id, commit_id, position),
            FOREIGN KEY (page_id, commit_id)
                REFERENCES commits (page_id, commit_id) ON DELETE CASCADE
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
