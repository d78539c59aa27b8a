//! Durable storage behind the commit store.
//!
//! [`PageStorage`] is implemented by the SQLite [`Database`] for on-disk
//! ledgers and by [`MemoryStorage`] for in-memory ones.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::commit::StoredCommit;
use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::PageId;

/// Persistence contract for the commits of every page of one ledger.
pub trait PageStorage: Send + Sync {
    /// Record that a page exists, even before it has commits beyond the root.
    fn create_page(&self, page: &PageId) -> Result<(), DatabaseError>;

    /// Persist one commit. Saving an already stored commit is a no-op.
    fn save_commit(&self, page: &PageId, commit: &StoredCommit) -> Result<(), DatabaseError>;

    /// Every stored commit of a page, in ascending generation order.
    fn load_commits(&self, page: &PageId) -> Result<Vec<StoredCommit>, DatabaseError>;

    fn list_pages(&self) -> Result<Vec<PageId>, DatabaseError>;

    /// Remove a page and all its commits.
    fn delete_page(&self, page: &PageId) -> Result<(), DatabaseError>;
}

impl PageStorage for Database {
    fn create_page(&self, page: &PageId) -> Result<(), DatabaseError> {
        self.insert_page(page)
    }

    fn save_commit(&self, page: &PageId, commit: &StoredCommit) -> Result<(), DatabaseError> {
        self.insert_commit(page, commit)
    }

    fn load_commits(&self, page: &PageId) -> Result<Vec<StoredCommit>, DatabaseError> {
        self.get_commits(page)
    }

    fn list_pages(&self) -> Result<Vec<PageId>, DatabaseError> {
        self.get_pages()
    }

    fn delete_page(&self, page: &PageId) -> Result<(), DatabaseError> {
        self.remove_page(page)
    }
}

// ---------------------------------------------------------------------------
// In-memory storage
// ---------------------------------------------------------------------------

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
    pages: Mutex<BTreeMap<PageId, Vec<StoredCommit>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn pages(&self) -> MutexGuard<'_, BTreeMap<PageId, Vec<StoredCommit>>> {
        self.pages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PageStorage for MemoryStorage {
    fn create_page(&self, page: &PageId) -> Result<(), DatabaseError> {
        self.pages().entry(page.clone()).or_default();
        Ok(())
    }

    fn save_commit(&self, page: &PageId, commit: &StoredCommit) -> Result<(), DatabaseError> {
        let mut pages = self.pages();
        let commits = pages.entry(page.clone()).or_default();
        if commits.iter().all(|c| c.id != commit.id) {
            commits.push(commit.clone());
        }
        Ok(())
    }

    fn load_commits(&self, page: &PageId) -> Result<Vec<StoredCommit>, DatabaseError> {
        let mut commits = self.pages().get(page).cloned().unwrap_or_default();
        commits.sort_by_key(|c| c.generation);
        Ok(commits)
    }

    fn list_pages(&self) -> Result<Vec<PageId>, DatabaseError> {
        Ok(self.pages().keys().cloned().collect())
    }

    fn delete_page(&self, page: &PageId) -> Result<(), DatabaseError> {
        let removed = self.pages().remove(page);
        debug!(page = %page, existed = removed.is_some(), "deleted in-memory page");
        Ok(())
    }
}
