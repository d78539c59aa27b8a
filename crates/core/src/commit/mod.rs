//! The commit graph of a page.
//!
//! - [`store`] owns the append-only DAG and answers ancestry questions.
//! - [`heads`] tracks which commits currently have no descendant.

pub mod heads;
pub mod store;

pub use heads::{HeadTracker, HeadsChanged};
pub use store::CommitStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{CommitId, EntryChange, Key, Value};

/// Immutable node of the commit graph.
///
/// `changes` is the delta against the first parent; `entries` is the full
/// materialized entry set, shared with snapshots.
#[derive(Debug, Clone)]
pub struct Commit {
    id: CommitId,
    parents: Vec<CommitId>,
    generation: u64,
    timestamp: DateTime<Utc>,
    changes: Arc<Vec<EntryChange>>,
    entries: Arc<BTreeMap<Key, Value>>,
}

impl Commit {
    /// The root commit every page starts from. Identical on every replica.
    pub fn root() -> Self {
        let timestamp = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            id: compute_id(&[], 0, &timestamp, &[]),
            parents: Vec::new(),
            generation: 0,
            timestamp,
            changes: Arc::new(Vec::new()),
            entries: Arc::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> &CommitId {
        &self.id
    }

    pub fn parents(&self) -> &[CommitId] {
        &self.parents
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }

    pub fn changes(&self) -> &[EntryChange] {
        &self.changes
    }

    pub fn entries(&self) -> &Arc<BTreeMap<Key, Value>> {
        &self.entries
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries.get(key)
    }

    pub(crate) fn to_stored(&self) -> StoredCommit {
        StoredCommit {
            id: self.id.clone(),
            parents: self.parents.clone(),
            generation: self.generation,
            timestamp: self.timestamp,
            changes: self.changes.as_ref().clone(),
        }
    }
}

/// A commit the caller wants appended. The store assigns the id and
/// generation.
#[derive(Debug, Clone)]
pub struct CommitDraft {
    pub parents: Vec<CommitId>,
    pub timestamp: DateTime<Utc>,
    /// Changes against the first parent, keys strictly ascending.
    pub changes: Vec<EntryChange>,
}

/// Persisted form of a commit: everything except the materialized entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCommit {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<EntryChange>,
}

impl Commit {
    pub(crate) fn materialize(
        parents: Vec<CommitId>,
        generation: u64,
        timestamp: DateTime<Utc>,
        changes: Vec<EntryChange>,
        first_parent: Option<&Commit>,
    ) -> Self {
        let mut entries = first_parent
            .map(|p| p.entries.as_ref().clone())
            .unwrap_or_default();
        for change in &changes {
            match &change.value {
                Some(value) => {
                    entries.insert(change.key.clone(), value.clone());
                }
                None => {
                    entries.remove(&change.key);
                }
            }
        }
        Self {
            id: compute_id(&parents, generation, &timestamp, &changes),
            parents,
            generation,
            timestamp,
            changes: Arc::new(changes),
            entries: Arc::new(entries),
        }
    }
}

/// Hash the identifying content of a commit.
pub(crate) fn compute_id(
    parents: &[CommitId],
    generation: u64,
    timestamp: &DateTime<Utc>,
    changes: &[EntryChange],
) -> CommitId {
    let mut hasher = Sha256::new();
    hasher.update(b"ledger-commit\0");
    hasher.update((parents.len() as u32).to_be_bytes());
    for parent in parents {
        hasher.update(parent.as_str().as_bytes());
    }
    hasher.update(generation.to_be_bytes());
    hasher.update(timestamp.timestamp().to_be_bytes());
    hasher.update(timestamp.timestamp_subsec_nanos().to_be_bytes());
    hasher.update((changes.len() as u64).to_be_bytes());
    for change in changes {
        hasher.update((change.key.len() as u64).to_be_bytes());
        hasher.update(&change.key);
        match &change.value {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update((value.len() as u64).to_be_bytes());
                hasher.update(value);
            }
            None => hasher.update([0u8]),
        }
    }
    CommitId::from_digest(&hasher.finalize())
}
