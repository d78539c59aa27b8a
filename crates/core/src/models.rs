//! Domain model types shared by the commit store, diff engine, merge
//! coordinator and watchers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A page key. Keys are arbitrary non-empty byte strings ordered bytewise.
pub type Key = Vec<u8>;

/// A page value.
pub type Value = Vec<u8>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Content-derived commit identifier (hex-encoded SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    /// Parse a hex commit id as printed by [`CommitId::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        (bytes.len() == 32).then(|| Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex digits, for logs and listings.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Page identifier: an opaque byte string, displayed as hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(Vec<u8>);

impl PageId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// A fresh random 16-byte page id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().filter(|b| !b.is_empty()).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Entries and changes
// ---------------------------------------------------------------------------

/// One key/value pair of a commit's entry set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Key,
    pub value: Value,
}

/// A mutation recorded in a commit. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryChange {
    pub key: Key,
    pub value: Option<Value>,
}

impl EntryChange {
    pub fn put(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// How one key differs across the merge base and the two conflicting heads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub key: Key,
    pub base: Option<Value>,
    pub left: Option<Value>,
    pub right: Option<Value>,
}

impl DiffEntry {
    pub(crate) fn encoded_len(&self) -> usize {
        self.key.len()
            + [&self.base, &self.left, &self.right]
                .iter()
                .map(|v| v.as_ref().map_or(0, Vec::len))
                .sum::<usize>()
    }
}

/// The change between two consecutive heads as seen by a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageChange {
    pub timestamp: DateTime<Utc>,
    pub changed_entries: Vec<Entry>,
    pub deleted_keys: Vec<Key>,
}

impl PageChange {
    pub fn is_empty(&self) -> bool {
        self.changed_entries.is_empty() && self.deleted_keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed_entries.len() + self.deleted_keys.len()
    }
}

// ---------------------------------------------------------------------------
// Merge instructions
// ---------------------------------------------------------------------------

/// Where the merged value of a key comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    /// Take the right head's value (deleting the key if right has none).
    Right,
    /// Remove the key.
    Delete,
    /// Use a value supplied by the resolver.
    New(Value),
}

/// A resolver's instruction for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedValue {
    pub key: Key,
    pub source: ValueSource,
}

impl MergedValue {
    pub fn right(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            source: ValueSource::Right,
        }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            source: ValueSource::Delete,
        }
    }

    pub fn new_value(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            source: ValueSource::New(value.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Policies and modes
// ---------------------------------------------------------------------------

/// How conflicts on a page are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Keep the most recent head's value on every conflicting key.
    #[default]
    LastOneWins,
    /// Always hand the conflict to the external resolver.
    Custom,
    /// Merge non-conflicting changes automatically, delegate the rest.
    AutomaticWithFallback,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastOneWins => write!(f, "last_one_wins"),
            Self::Custom => write!(f, "custom"),
            Self::AutomaticWithFallback => write!(f, "automatic_with_fallback"),
        }
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_one_wins" => Ok(Self::LastOneWins),
            "custom" => Ok(Self::Custom),
            "automatic_with_fallback" | "automatic" => Ok(Self::AutomaticWithFallback),
            other => Err(format!("unknown merge policy '{other}'")),
        }
    }
}

/// Which keys a three-way diff reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    /// Every key touched by either side.
    Full,
    /// Keys touched by both sides with differing results.
    ConflictingOnly,
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Status returned across the page boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    PartialResult,
    AuthError,
    NotFound,
    UnknownError,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::PartialResult => write!(f, "PARTIAL_RESULT"),
            Self::AuthError => write!(f, "AUTH_ERROR"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::UnknownError => write!(f, "UNKNOWN_ERROR"),
        }
    }
}

/// Position of one watcher notification within a change split over
/// several notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    Completed,
    PartialStarted,
    PartialContinued,
    PartialCompleted,
}

/// Outcome of waiting for a page's conflicts to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionWaitStatus {
    /// Nothing was pending when the wait started.
    NoConflicts,
    /// Pending conflicts were resolved while waiting.
    ConflictsResolved,
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Opaque continuation token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(pub(crate) Vec<u8>);

impl Token {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One bounded page of a listing.
///
/// Constructed only through [`Paginated::complete`] and
/// [`Paginated::partial`], so `Ok` always comes without a token and
/// `PartialResult` always with one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paginated<T> {
    status: Status,
    items: Vec<T>,
    next_token: Option<Token>,
}

impl<T> Paginated<T> {
    pub(crate) fn complete(items: Vec<T>) -> Self {
        Self {
            status: Status::Ok,
            items,
            next_token: None,
        }
    }

    pub(crate) fn partial(items: Vec<T>, token: Token) -> Self {
        Self {
            status: Status::PartialResult,
            items,
            next_token: Some(token),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn next_token(&self) -> Option<&Token> {
        self.next_token.as_ref()
    }

    pub fn is_partial(&self) -> bool {
        self.next_token.is_some()
    }

    pub fn into_parts(self) -> (Status, Vec<T>, Option<Token>) {
        (self.status, self.items, self.next_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_id_parse() {
        let id = CommitId::from_digest(&[0xab; 32]);
        assert_eq!(CommitId::parse(id.as_str()), Some(id.clone()));
        assert_eq!(id.short().len(), 12);
        assert!(CommitId::parse("abcd").is_none());
        assert!(CommitId::parse("not hex").is_none());
    }

    #[test]
    fn test_page_id_hex_round_trip() {
        let id = PageId::new(b"page".to_vec());
        assert_eq!(id.to_string(), "70616765");
        assert_eq!(PageId::from_hex("70616765"), Some(id));
        assert!(PageId::from_hex("").is_none());
        assert_eq!(PageId::random().as_bytes().len(), 16);
    }

    #[test]
    fn test_merge_policy_parse_and_display() {
        for policy in [
            MergePolicy::LastOneWins,
            MergePolicy::Custom,
            MergePolicy::AutomaticWithFallback,
        ] {
            assert_eq!(policy.to_string().parse::<MergePolicy>(), Ok(policy));
        }
        assert_eq!(
            "automatic".parse::<MergePolicy>(),
            Ok(MergePolicy::AutomaticWithFallback)
        );
        assert!("ours".parse::<MergePolicy>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&Status::PartialResult).unwrap();
        assert_eq!(json, "\"PARTIAL_RESULT\"");
        assert_eq!(Status::NotFound.to_string(), "NOT_FOUND");
    }

    #[test]
    fn test_paginated_pairing() {
        let page: Paginated<u8> = Paginated::complete(vec![1, 2]);
        assert_eq!(page.status(), Status::Ok);
        assert!(page.next_token().is_none());

        let page = Paginated::partial(vec![1], Token(vec![9]));
        assert_eq!(page.status(), Status::PartialResult);
        assert!(page.is_partial());
    }
}
