//! Typed query helpers for the pages and commits tables.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use tracing::debug;

use super::Database;
use crate::commit::StoredCommit;
use crate::errors::DatabaseError;
use crate::models::{CommitId, EntryChange, PageId};

/// A row from the `commits` table before its changes are attached.
struct CommitRow {
    commit_id: String,
    parents: String,
    generation: i64,
    timestamp: String,
}

fn corrupt(id: &str, detail: impl ToString) -> DatabaseError {
    DatabaseError::Corrupt {
        entity: "commit".into(),
        id: id.to_string(),
        detail: detail.to_string(),
    }
}

impl Database {
    // -- pages --------------------------------------------------------------

    /// Register a page. Registering an existing page is a no-op.
    pub fn insert_page(&self, page: &PageId) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO pages (page_id, created_at) VALUES (?1, ?2)",
            params![page.to_hex(), now],
        )?;
        Ok(())
    }

    /// All registered pages, ordered by id.
    pub fn get_pages(&self) -> Result<Vec<PageId>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT page_id FROM pages ORDER BY page_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut pages = Vec::new();
        for row in rows {
            let hex = row?;
            let page = PageId::from_hex(&hex).ok_or_else(|| DatabaseError::Corrupt {
                entity: "page".into(),
                id: hex.clone(),
                detail: "page id is not valid hex".into(),
            })?;
            pages.push(page);
        }
        Ok(pages)
    }

    /// Delete a page; its commits and changes cascade.
    pub fn remove_page(&self, page: &PageId) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM pages WHERE page_id = ?1", params![page.to_hex()])?;
        debug!(page = %page, removed, "deleted page rows");
        Ok(())
    }

    // -- commits ------------------------------------------------------------

    /// Persist a commit and its change list atomically.
    pub fn insert_commit(&self, page: &PageId, commit: &StoredCommit) -> Result<(), DatabaseError> {
        let page_hex = page.to_hex();
        let parents = serde_json::to_string(&commit.parents)
            .map_err(|e| corrupt(commit.id.as_str(), e))?;
        let timestamp = commit
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true);
        let generation = i64::try_from(commit.generation)
            .map_err(|e| corrupt(commit.id.as_str(), e))?;

        self.transaction(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO pages (page_id, created_at) VALUES (?1, ?2)",
                params![page_hex, Utc::now().to_rfc3339()],
            )?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO commits (page_id, commit_id, parents, generation, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![page_hex, commit.id.as_str(), parents, generation, timestamp],
            )?;
            if inserted == 0 {
                return Ok(());
            }

            let mut stmt = conn.prepare(
                "INSERT INTO commit_changes (page_id, commit_id, position, key, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (position, change) in commit.changes.iter().enumerate() {
                stmt.execute(params![
                    page_hex,
                    commit.id.as_str(),
                    position as i64,
                    change.key,
                    change.value
                ])?;
            }
            Ok(())
        })?;

        debug!(
            page = %page,
            commit = commit.id.short(),
            changes = commit.changes.len(),
            "stored commit"
        );
        Ok(())
    }

    /// Every commit of a page in ascending generation order.
    pub fn get_commits(&self, page: &PageId) -> Result<Vec<StoredCommit>, DatabaseError> {
        let page_hex = page.to_hex();
        let conn = self.conn();

        let mut changes: HashMap<String, Vec<EntryChange>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT commit_id, key, value FROM commit_changes
                 WHERE page_id = ?1 ORDER BY commit_id, position",
            )?;
            let rows = stmt.query_map(params![page_hex], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    EntryChange {
                        key: row.get(1)?,
                        value: row.get(2)?,
                    },
                ))
            })?;
            for row in rows {
                let (commit_id, change) = row?;
                changes.entry(commit_id).or_default().push(change);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT commit_id, parents, generation, timestamp FROM commits
             WHERE page_id = ?1 ORDER BY generation, commit_id",
        )?;
        let rows = stmt.query_map(params![page_hex], |row| {
            Ok(CommitRow {
                commit_id: row.get(0)?,
                parents: row.get(1)?,
                generation: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?;

        let mut commits = Vec::new();
        for row in rows {
            let row = row?;
            let id = CommitId::parse(&row.commit_id)
                .ok_or_else(|| corrupt(&row.commit_id, "commit id is not a sha-256 hex digest"))?;
            let parents: Vec<CommitId> =
                serde_json::from_str(&row.parents).map_err(|e| corrupt(&row.commit_id, e))?;
            let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
                .map_err(|e| corrupt(&row.commit_id, e))?
                .with_timezone(&Utc);
            let generation =
                u64::try_from(row.generation).map_err(|e| corrupt(&row.commit_id, e))?;
            commits.push(StoredCommit {
                changes: changes.remove(&row.commit_id).unwrap_or_default(),
                id,
                parents,
                generation,
                timestamp,
            });
        }
        Ok(commits)
    }
}
