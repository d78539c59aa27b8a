//! Head set maintenance.

use std::collections::BTreeSet;

use tracing::debug;

use super::{Commit, CommitStore};
use crate::errors::CommitError;
use crate::models::CommitId;

/// Emitted whenever an append changes the head set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadsChanged {
    pub appended: CommitId,
    pub heads: Vec<CommitId>,
}

impl HeadsChanged {
    pub fn is_conflicted(&self) -> bool {
        self.heads.len() > 1
    }
}

/// The commits of a page that have no known descendant.
#[derive(Debug, Clone, Default)]
pub struct HeadTracker {
    heads: BTreeSet<CommitId>,
}

impl HeadTracker {
    /// Heads of an already populated store: every commit that is nobody's
    /// parent.
    pub fn from_store(store: &CommitStore) -> Self {
        let log = store.log();
        let parents: BTreeSet<&CommitId> = log.iter().flat_map(|c| c.parents()).collect();
        let heads = log
            .iter()
            .map(|c| c.id())
            .filter(|id| !parents.contains(id))
            .cloned()
            .collect();
        Self { heads }
    }

    pub fn current_heads(&self) -> Vec<CommitId> {
        self.heads.iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_conflicted(&self) -> bool {
        self.heads.len() > 1
    }

    /// Fold a freshly appended commit into the head set.
    ///
    /// Heads that are ancestors of the new commit are dropped. A commit that
    /// is already a head, or an ancestor of one, leaves the set unchanged and
    /// yields `None`.
    pub fn on_append(
        &mut self,
        commit: &Commit,
        store: &CommitStore,
    ) -> Result<Option<HeadsChanged>, CommitError> {
        for head in &self.heads {
            if store.is_ancestor(commit.id(), head)? {
                return Ok(None);
            }
        }

        let mut superseded = Vec::new();
        for head in &self.heads {
            if store.is_ancestor(head, commit.id())? {
                superseded.push(head.clone());
            }
        }
        for head in &superseded {
            self.heads.remove(head);
        }
        self.heads.insert(commit.id().clone());

        debug!(
            commit = commit.id().short(),
            superseded = superseded.len(),
            heads = self.heads.len(),
            "head set changed"
        );
        Ok(Some(HeadsChanged {
            appended: commit.id().clone(),
            heads: self.current_heads(),
        }))
    }
}
