//! Append-only commit DAG of one page.
//!
//! Commits are validated on append (parents known, at most two of them,
//! change keys non-empty and strictly ascending), persisted through the
//! page's [`PageStorage`], and then kept in memory with their entry sets
//! materialized. Ancestry queries walk the graph backwards in descending
//! generation order and stop as soon as generations drop below the target.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::{Commit, CommitDraft};
use crate::errors::{CommitError, LedgerError, PaginationError};
use crate::models::{CommitId, Entry, PageId, Paginated, Token};
use crate::pagination::{paginate, Fingerprint, PageLimits};
use crate::storage::PageStorage;

/// The commit graph of one page.
pub struct CommitStore {
    page_id: PageId,
    storage: Arc<dyn PageStorage>,
    commits: HashMap<CommitId, Arc<Commit>>,
    root: Arc<Commit>,
    entries_limits: PageLimits,
    latest_timestamp: DateTime<Utc>,
}

impl CommitStore {
    /// Load the page's commits from storage, registering the page with a
    /// root commit if it has never been stored.
    pub fn open(
        page_id: PageId,
        storage: Arc<dyn PageStorage>,
        entries_limits: PageLimits,
    ) -> Result<Self, CommitError> {
        let stored = storage.load_commits(&page_id)?;
        let root = Arc::new(Commit::root());

        let mut store = Self {
            page_id,
            storage,
            commits: HashMap::new(),
            root: root.clone(),
            entries_limits,
            latest_timestamp: root.timestamp(),
        };
        store.insert(root.clone());

        if stored.is_empty() {
            store.storage.create_page(&store.page_id)?;
            store
                .storage
                .save_commit(&store.page_id, &root.to_stored())?;
        }

        for record in stored {
            if store.commits.contains_key(&record.id) {
                continue;
            }
            let commit = store.build(CommitDraft {
                parents: record.parents,
                timestamp: record.timestamp,
                changes: record.changes,
            })?;
            if commit.id() != &record.id || commit.generation() != record.generation {
                return Err(CommitError::Corrupt(format!(
                    "stored commit {} does not match its content",
                    record.id
                )));
            }
            store.insert(Arc::new(commit));
        }

        info!(
            page = %store.page_id,
            commits = store.commits.len(),
            "opened commit store"
        );
        Ok(store)
    }

    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    pub fn root(&self) -> &Arc<Commit> {
        &self.root
    }

    pub fn entries_limits(&self) -> PageLimits {
        self.entries_limits
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn contains(&self, id: &CommitId) -> bool {
        self.commits.contains_key(id)
    }

    /// Validate, persist and index a new commit.
    ///
    /// Appending a commit whose content already exists returns the stored
    /// commit unchanged.
    pub fn append(&mut self, draft: CommitDraft) -> Result<Arc<Commit>, CommitError> {
        let commit = self.build(draft)?;
        if let Some(existing) = self.commits.get(commit.id()) {
            debug!(commit = commit.id().short(), "commit already present");
            return Ok(existing.clone());
        }

        self.storage.save_commit(&self.page_id, &commit.to_stored())?;
        let commit = Arc::new(commit);
        self.insert(commit.clone());

        debug!(
            page = %self.page_id,
            commit = commit.id().short(),
            generation = commit.generation(),
            parents = commit.parents().len(),
            changes = commit.changes().len(),
            "appended commit"
        );
        Ok(commit)
    }

    pub fn get_commit(&self, id: &CommitId) -> Result<Arc<Commit>, CommitError> {
        self.commits
            .get(id)
            .cloned()
            .ok_or_else(|| CommitError::NotFound(id.to_string()))
    }

    /// One bounded page of a commit's entries, resuming from `token`.
    pub fn get_entries(
        &self,
        id: &CommitId,
        token: Option<&Token>,
    ) -> Result<Paginated<Entry>, LedgerError> {
        let commit = self.get_commit(id)?;
        Ok(entries_page(&commit, b"", token, self.entries_limits)?)
    }

    /// Every commit, oldest generation first.
    pub fn log(&self) -> Vec<Arc<Commit>> {
        let mut all: Vec<_> = self.commits.values().cloned().collect();
        all.sort_by(|a, b| {
            a.generation()
                .cmp(&b.generation())
                .then_with(|| a.timestamp().cmp(&b.timestamp()))
                .then_with(|| a.id().cmp(b.id()))
        });
        all
    }

    /// A timestamp for a new local commit, strictly later than every commit
    /// already known to this page.
    pub fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        if now > self.latest_timestamp {
            now
        } else {
            self.latest_timestamp + Duration::nanoseconds(1)
        }
    }

    /// Whether `ancestor` is reachable from `descendant` (a commit is its own
    /// ancestor).
    pub fn is_ancestor(
        &self,
        ancestor: &CommitId,
        descendant: &CommitId,
    ) -> Result<bool, CommitError> {
        let target = self.get_commit(ancestor)?;
        let start = self.get_commit(descendant)?;

        let mut queue = BinaryHeap::new();
        let mut seen = HashSet::new();
        queue.push((start.generation(), Reverse(start.id().clone())));
        seen.insert(start.id().clone());

        while let Some((generation, Reverse(id))) = queue.pop() {
            if id == *target.id() {
                return Ok(true);
            }
            if generation <= target.generation() {
                continue;
            }
            for parent in self.get_commit(&id)?.parents() {
                if seen.insert(parent.clone()) {
                    let parent = self.get_commit(parent)?;
                    queue.push((parent.generation(), Reverse(parent.id().clone())));
                }
            }
        }
        Ok(false)
    }

    /// Lowest common ancestor of two commits.
    ///
    /// Among common ancestors the one with the highest generation wins, and
    /// equal generations are broken by the lexicographically smallest id.
    pub fn merge_base(&self, a: &CommitId, b: &CommitId) -> Result<CommitId, CommitError> {
        const FROM_A: u8 = 0b01;
        const FROM_B: u8 = 0b10;

        let a = self.get_commit(a)?;
        let b = self.get_commit(b)?;
        if a.id() == b.id() {
            return Ok(a.id().clone());
        }

        // Popped in descending generation, then ascending id. A commit's
        // color is final when popped because every child has a strictly
        // higher generation.
        let mut colors: HashMap<CommitId, u8> = HashMap::new();
        let mut queue = BinaryHeap::new();
        for (commit, color) in [(&a, FROM_A), (&b, FROM_B)] {
            colors.insert(commit.id().clone(), color);
            queue.push((commit.generation(), Reverse(commit.id().clone())));
        }

        while let Some((_, Reverse(id))) = queue.pop() {
            let color = colors.get(&id).copied().unwrap_or_default();
            if color == FROM_A | FROM_B {
                return Ok(id);
            }
            for parent in self.get_commit(&id)?.parents() {
                match colors.get_mut(parent) {
                    Some(existing) => *existing |= color,
                    None => {
                        colors.insert(parent.clone(), color);
                        let generation = self.get_commit(parent)?.generation();
                        queue.push((generation, Reverse(parent.clone())));
                    }
                }
            }
        }

        // Every page shares the root, so this only happens on a broken graph.
        Err(CommitError::Corrupt(format!(
            "commits {} and {} have no common ancestor",
            a.id(),
            b.id()
        )))
    }

    fn insert(&mut self, commit: Arc<Commit>) {
        if commit.timestamp() > self.latest_timestamp {
            self.latest_timestamp = commit.timestamp();
        }
        self.commits.insert(commit.id().clone(), commit);
    }

    fn build(&self, draft: CommitDraft) -> Result<Commit, CommitError> {
        let CommitDraft {
            parents,
            timestamp,
            changes,
        } = draft;

        match parents.len() {
            0 => {
                return Err(CommitError::Corrupt(
                    "only the root commit may have no parents".into(),
                ))
            }
            1 | 2 => {}
            n => return Err(CommitError::TooManyParents(n)),
        }
        if parents.len() == 2 && parents[0] == parents[1] {
            return Err(CommitError::Corrupt("merge parents must differ".into()));
        }

        let mut generation = 0;
        for parent in &parents {
            let parent = self
                .commits
                .get(parent)
                .ok_or_else(|| CommitError::InvalidParent {
                    parent: parent.to_string(),
                })?;
            generation = generation.max(parent.generation() + 1);
        }

        for (i, change) in changes.iter().enumerate() {
            if change.key.is_empty() {
                return Err(CommitError::Corrupt(format!("change {i} has an empty key")));
            }
            if i > 0 && changes[i - 1].key >= change.key {
                return Err(CommitError::Corrupt(format!(
                    "change keys are not strictly ascending at position {i}"
                )));
            }
        }

        let first_parent = self.commits.get(&parents[0]).cloned();
        Ok(Commit::materialize(
            parents,
            generation,
            timestamp,
            changes,
            first_parent.as_deref(),
        ))
    }
}

/// One bounded page of the entries of `commit` whose key starts with
/// `prefix`.
pub(crate) fn entries_page(
    commit: &Commit,
    prefix: &[u8],
    token: Option<&Token>,
    limits: PageLimits,
) -> Result<Paginated<Entry>, PaginationError> {
    let fingerprint = Fingerprint::of(&[
        b"entries".as_slice(),
        commit.id().as_str().as_bytes(),
        prefix,
    ]);
    let start = fingerprint.resume_key(token)?.unwrap_or(prefix).to_vec();
    let items = commit
        .entries()
        .range(start..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| Entry {
            key: key.clone(),
            value: value.clone(),
        });
    Ok(paginate(
        items,
        limits,
        fingerprint,
        |e| e.key.as_slice(),
        |e| e.key.len() + e.value.len(),
    ))
}
