//! Conflict detection.
//!
//! When a page has more than one head, the detector picks the two most
//! recent heads and pairs them with their merge base. More than two heads
//! are collapsed pairwise, most recent first.

use std::cmp::Ordering;
use std::fmt;

use tracing::debug;

use crate::commit::{Commit, CommitStore};
use crate::errors::CommitError;
use crate::models::CommitId;

/// Two divergent heads and their merge base.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Conflict {
    /// The more recently created head.
    pub left: CommitId,
    /// The other head.
    pub right: CommitId,
    /// Lowest common ancestor of `left` and `right`.
    pub base: CommitId,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "left {} / right {} (base {})",
            self.left.short(),
            self.right.short(),
            self.base.short()
        )
    }
}

/// Stateless conflict detection.
pub struct ConflictDetector;

impl ConflictDetector {
    /// The conflict to resolve next, or `None` if there is at most one head.
    pub fn detect(
        heads: &[CommitId],
        store: &CommitStore,
    ) -> Result<Option<Conflict>, CommitError> {
        if heads.len() < 2 {
            return Ok(None);
        }

        let mut commits = heads
            .iter()
            .map(|id| store.get_commit(id))
            .collect::<Result<Vec<_>, _>>()?;
        commits.sort_by(|a, b| recency(b, a));

        let left = commits[0].id().clone();
        let right = commits[1].id().clone();
        let base = store.merge_base(&left, &right)?;

        let conflict = Conflict { left, right, base };
        debug!(heads = heads.len(), %conflict, "detected conflict");
        Ok(Some(conflict))
    }
}

/// Orders commits from oldest to most recent: generation, then timestamp,
/// then id.
pub(crate) fn recency(a: &Commit, b: &Commit) -> Ordering {
    a.generation()
        .cmp(&b.generation())
        .then_with(|| a.timestamp().cmp(&b.timestamp()))
        .then_with(|| a.id().cmp(b.id()))
}
