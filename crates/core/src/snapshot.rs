//! Read-only views of a page at one commit.

use std::sync::Arc;

use crate::commit::store::entries_page;
use crate::commit::Commit;
use crate::errors::PaginationError;
use crate::models::{CommitId, Entry, Key, PageId, Paginated, Token, Value};
use crate::pagination::PageLimits;

/// The entries of a page as of one commit.
///
/// Snapshots share the commit's entry set, so they are cheap to clone and
/// stay readable after the page itself is deleted.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    page_id: PageId,
    commit: Arc<Commit>,
    limits: PageLimits,
}

impl PageSnapshot {
    pub(crate) fn new(page_id: PageId, commit: Arc<Commit>, limits: PageLimits) -> Self {
        Self {
            page_id,
            commit,
            limits,
        }
    }

    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    pub fn commit_id(&self) -> &CommitId {
        self.commit.id()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.commit.get(key)
    }

    pub fn len(&self) -> usize {
        self.commit.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commit.entries().is_empty()
    }

    /// One page of the entries whose key starts with `prefix`.
    pub fn get_entries(
        &self,
        prefix: &[u8],
        token: Option<&Token>,
    ) -> Result<Paginated<Entry>, PaginationError> {
        entries_page(&self.commit, prefix, token, self.limits)
    }

    /// One page of the keys starting with `prefix`.
    pub fn get_keys(
        &self,
        prefix: &[u8],
        token: Option<&Token>,
    ) -> Result<Paginated<Key>, PaginationError> {
        let (_, entries, next) = self.get_entries(prefix, token)?.into_parts();
        let keys = entries.into_iter().map(|e| e.key).collect();
        Ok(match next {
            Some(token) => Paginated::partial(keys, token),
            None => Paginated::complete(keys),
        })
    }

    /// All entries in key order.
    pub fn entries(&self) -> Vec<Entry> {
        self.commit
            .entries()
            .iter()
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }
}
