//! Key-level differences between commits.
//!
//! The three-way diff walks the union of the base, left and right entry
//! sets in ascending key order, resuming from a continuation token. Tokens
//! are bound to the exact (base, left, right, mode) they were issued for.

use std::collections::btree_map::Range;
use std::iter::Peekable;

use tracing::error;

use crate::commit::Commit;
use crate::errors::PaginationError;
use crate::models::{DiffEntry, DiffMode, Entry, Key, PageChange, Paginated, Status, Token, Value};
use crate::pagination::{paginate, Fingerprint, PageLimits};

/// Computes diffs with a fixed page size.
#[derive(Debug, Clone, Copy)]
pub struct DiffEngine {
    limits: PageLimits,
}

impl DiffEngine {
    pub fn new(limits: PageLimits) -> Self {
        Self { limits }
    }

    /// One page of the three-way diff of `left` and `right` against `base`.
    pub fn diff(
        &self,
        base: &Commit,
        left: &Commit,
        right: &Commit,
        mode: DiffMode,
        token: Option<&Token>,
    ) -> Result<Paginated<DiffEntry>, PaginationError> {
        let mode_tag: &[u8] = match mode {
            DiffMode::Full => b"full",
            DiffMode::ConflictingOnly => b"conflicting",
        };
        let fingerprint = Fingerprint::of(&[
            b"diff".as_slice(),
            base.id().as_str().as_bytes(),
            left.id().as_str().as_bytes(),
            right.id().as_str().as_bytes(),
            mode_tag,
        ]);
        let start = fingerprint.resume_key(token)?.unwrap_or_default().to_vec();

        let entries = three_way(base, left, right, &start).filter(|entry| match mode {
            DiffMode::Full => true,
            DiffMode::ConflictingOnly => is_conflicting(entry),
        });
        let page = paginate(
            entries,
            self.limits,
            fingerprint,
            |e| e.key.as_slice(),
            DiffEntry::encoded_len,
        );
        check_pairing(&page)?;
        Ok(page)
    }

    /// The change a watcher sees when moving from `from` to `to`.
    pub fn page_change(&self, from: &Commit, to: &Commit) -> PageChange {
        let mut changed_entries = Vec::new();
        let mut deleted_keys = Vec::new();
        // Reuse the three-way walk with `from` as both base and right.
        for entry in three_way(from, to, from, &[]) {
            match entry.left {
                Some(value) => changed_entries.push(Entry {
                    key: entry.key,
                    value,
                }),
                None => deleted_keys.push(entry.key),
            }
        }
        PageChange {
            timestamp: to.timestamp(),
            changed_entries,
            deleted_keys,
        }
    }
}

/// Changed on both sides, to different results.
pub(crate) fn is_conflicting(entry: &DiffEntry) -> bool {
    entry.left != entry.base && entry.right != entry.base && entry.left != entry.right
}

/// Whether any key needs a resolver to pick between left and right.
pub(crate) fn has_conflicts(base: &Commit, left: &Commit, right: &Commit) -> bool {
    three_way(base, left, right, &[]).any(|entry| is_conflicting(&entry))
}

fn check_pairing<T>(page: &Paginated<T>) -> Result<(), PaginationError> {
    let consistent = match page.status() {
        Status::Ok => page.next_token().is_none(),
        Status::PartialResult => page.next_token().is_some(),
        _ => false,
    };
    if consistent {
        return Ok(());
    }
    error!(status = %page.status(), has_token = page.next_token().is_some(), "diff page has inconsistent status");
    Err(PaginationError::InvariantViolation(format!(
        "status {} with token present = {}",
        page.status(),
        page.next_token().is_some()
    )))
}

/// Keys where left or right differs from base, ascending, from `start`.
pub(crate) fn three_way<'a>(
    base: &'a Commit,
    left: &'a Commit,
    right: &'a Commit,
    start: &[u8],
) -> impl Iterator<Item = DiffEntry> + 'a {
    let start = start.to_vec();
    let union = KeyUnion {
        base: base.entries().range(start.clone()..).peekable(),
        left: left.entries().range(start.clone()..).peekable(),
        right: right.entries().range(start..).peekable(),
    };
    union.filter_map(|(key, b, l, r)| {
        if l == b && r == b {
            return None;
        }
        Some(DiffEntry {
            key: key.clone(),
            base: b.cloned(),
            left: l.cloned(),
            right: r.cloned(),
        })
    })
}

type Side<'a> = Peekable<Range<'a, Key, Value>>;

/// Sorted merge of three entry ranges.
struct KeyUnion<'a> {
    base: Side<'a>,
    left: Side<'a>,
    right: Side<'a>,
}

impl<'a> Iterator for KeyUnion<'a> {
    type Item = (&'a Key, Option<&'a Value>, Option<&'a Value>, Option<&'a Value>);

    fn next(&mut self) -> Option<Self::Item> {
        let key = [&mut self.base, &mut self.left, &mut self.right]
            .into_iter()
            .filter_map(|side| side.peek().map(|(k, _)| *k))
            .min()?;

        let take = |side: &mut Side<'a>| -> Option<&'a Value> {
            side.next_if(|(k, _)| *k == key).map(|(_, v)| v)
        };
        let b = take(&mut self.base);
        let l = take(&mut self.left);
        let r = take(&mut self.right);
        Some((key, b, l, r))
    }
}
