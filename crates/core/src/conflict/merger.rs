//! Merge algorithms.
//!
//! Every merge commit is built on top of the left (most recent) head: its
//! change list is the delta from left's entries to the merged entries, and
//! its parents are `[left, right]`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::detector::Conflict;
use crate::commit::{Commit, CommitDraft};
use crate::diff::{has_conflicts, three_way};
use crate::models::{EntryChange, Key, ValueSource};

/// Stateless merge operations over a conflict's three commits.
pub struct Merger;

impl Merger {
    /// Keys changed by right only (left still holds the base value).
    pub fn right_only_keys(base: &Commit, left: &Commit, right: &Commit) -> Vec<Key> {
        three_way(base, left, right, &[])
            .filter(|entry| entry.left == entry.base && entry.right != entry.base)
            .map(|entry| entry.key)
            .collect()
    }

    /// Instructions that carry every right-only change into the merge.
    pub fn non_conflicting_instructions(
        base: &Commit,
        left: &Commit,
        right: &Commit,
    ) -> BTreeMap<Key, ValueSource> {
        Self::right_only_keys(base, left, right)
            .into_iter()
            .map(|key| (key, ValueSource::Right))
            .collect()
    }

    /// Last one wins: left's entries with right's unilateral changes added.
    /// On keys both sides changed, the most recent head (left) is kept.
    pub fn last_one_wins(base: &Commit, left: &Commit, right: &Commit) -> Vec<EntryChange> {
        let instructions = Self::non_conflicting_instructions(base, left, right);
        Self::apply_instructions(left, right, &instructions)
    }

    /// Automatic merge, or `None` if some key needs a resolver.
    pub fn automatic(base: &Commit, left: &Commit, right: &Commit) -> Option<Vec<EntryChange>> {
        if has_conflicts(base, left, right) {
            return None;
        }
        Some(Self::last_one_wins(base, left, right))
    }

    /// Change list, relative to left, that applies `instructions`.
    pub fn apply_instructions(
        left: &Commit,
        right: &Commit,
        instructions: &BTreeMap<Key, ValueSource>,
    ) -> Vec<EntryChange> {
        let mut changes = Vec::new();
        for (key, source) in instructions {
            let merged = match source {
                ValueSource::Right => right.get(key).cloned(),
                ValueSource::Delete => None,
                ValueSource::New(value) => Some(value.clone()),
            };
            if merged.as_ref() != left.get(key) {
                changes.push(EntryChange {
                    key: key.clone(),
                    value: merged,
                });
            }
        }
        debug!(
            instructions = instructions.len(),
            changes = changes.len(),
            "applied merge instructions"
        );
        changes
    }

    /// Draft of the two-parent commit that resolves `conflict`.
    pub fn merge_draft(
        conflict: &Conflict,
        changes: Vec<EntryChange>,
        timestamp: DateTime<Utc>,
    ) -> CommitDraft {
        CommitDraft {
            parents: vec![conflict.left.clone(), conflict.right.clone()],
            timestamp,
            changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;

    fn commit(parent: &Commit, changes: &[(&str, Option<&str>)]) -> Commit {
        let mut changes: Vec<EntryChange> = changes
            .iter()
            .map(|(k, v)| EntryChange {
                key: k.as_bytes().to_vec(),
                value: v.map(|v| v.as_bytes().to_vec()),
            })
            .collect();
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        Commit::materialize(
            vec![parent.id().clone()],
            parent.generation() + 1,
            Utc::now(),
            changes,
            Some(parent),
        )
    }

    fn apply(left: &Commit, changes: &[EntryChange]) -> BTreeMap<Key, Value> {
        let mut entries = left.entries().as_ref().clone();
        for change in changes {
            match &change.value {
                Some(v) => {
                    entries.insert(change.key.clone(), v.clone());
                }
                None => {
                    entries.remove(&change.key);
                }
            }
        }
        entries
    }

    fn b(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn test_automatic_unions_disjoint_changes() {
        let base = commit(&Commit::root(), &[("shared", Some("0")), ("gone", Some("x"))]);
        let left = commit(&base, &[("name", Some("Alice"))]);
        let right = commit(&base, &[("phone", Some("0123")), ("gone", None)]);

        let changes = Merger::automatic(&base, &left, &right).unwrap();
        let merged = apply(&left, &changes);
        assert_eq!(merged.get(&b("name")), Some(&b("Alice")));
        assert_eq!(merged.get(&b("phone")), Some(&b("0123")));
        assert_eq!(merged.get(&b("shared")), Some(&b("0")));
        assert!(!merged.contains_key(&b("gone")));
    }

    #[test]
    fn test_automatic_refuses_real_conflict() {
        let base = Commit::root();
        let left = commit(&base, &[("name", Some("Alice"))]);
        let right = commit(&base, &[("name", Some("Bob"))]);
        assert!(Merger::automatic(&base, &left, &right).is_none());
    }

    #[test]
    fn test_identical_changes_do_not_conflict() {
        let base = Commit::root();
        let left = commit(&base, &[("name", Some("Alice"))]);
        let right = commit(&base, &[("name", Some("Alice"))]);
        let changes = Merger::automatic(&base, &left, &right).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_last_one_wins_keeps_left_on_conflict() {
        let base = Commit::root();
        let left = commit(&base, &[("name", Some("Alice")), ("city", Some("Paris"))]);
        let right = commit(&base, &[("name", Some("Bob")), ("phone", Some("0123"))]);

        let merged = apply(&left, &Merger::last_one_wins(&base, &left, &right));
        assert_eq!(merged.get(&b("name")), Some(&b("Alice")));
        assert_eq!(merged.get(&b("city")), Some(&b("Paris")));
        assert_eq!(merged.get(&b("phone")), Some(&b("0123")));
    }

    #[test]
    fn test_apply_instructions() {
        let base = Commit::root();
        let left = commit(&base, &[("name", Some("Alice")), ("city", Some("Paris"))]);
        let right = commit(&base, &[("name", Some("Bob")), ("phone", Some("0123"))]);

        let mut instructions = BTreeMap::new();
        instructions.insert(b("name"), ValueSource::Right);
        instructions.insert(b("phone"), ValueSource::Right);
        instructions.insert(b("city"), ValueSource::Right);
        instructions.insert(b("pager"), ValueSource::New(b("555")));

        let merged = apply(&left, &Merger::apply_instructions(&left, &right, &instructions));
        let expected: BTreeMap<Key, Value> = [
            (b("name"), b("Bob")),
            (b("pager"), b("555")),
            (b("phone"), b("0123")),
        ]
        .into_iter()
        .collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_merge_draft_parent_order() {
        let conflict = Conflict {
            left: Commit::root().id().clone(),
            right: crate::models::CommitId::from_digest(&[1; 32]),
            base: Commit::root().id().clone(),
        };
        let draft = Merger::merge_draft(&conflict, Vec::new(), Utc::now());
        assert_eq!(draft.parents, vec![conflict.left.clone(), conflict.right.clone()]);
    }
}
