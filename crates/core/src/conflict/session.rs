//! Resolution sessions.
//!
//! A session is the coordinator's record of one conflict handed to an
//! external resolver. It moves `Open -> Merging -> Done`, or to `Cancelled`
//! when the resolver disconnects, is replaced, or the page goes away.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::detector::Conflict;
use super::merger::Merger;
use crate::commit::{CommitDraft, CommitStore};
use crate::diff::DiffEngine;
use crate::errors::{LedgerError, ResolutionError};
use crate::models::{DiffEntry, DiffMode, Key, MergedValue, Paginated, Token, ValueSource};
use crate::page::Reply;

/// Identifies a session: the resolver generation it was opened under and a
/// per-page sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub generation: u64,
    pub seq: u64,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.seq)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Request delivered; diffs may be queried.
    Open,
    /// At least one batch of merge instructions received.
    Merging,
    /// The merge commit was built.
    Done,
    Cancelled,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Merging => write!(f, "merging"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A resolver call routed to a session through the page loop.
pub(crate) enum SessionOp {
    Diff {
        mode: DiffMode,
        token: Option<Token>,
        reply: Reply<Paginated<DiffEntry>>,
    },
    Merge {
        values: Vec<MergedValue>,
        reply: Reply<()>,
    },
    MergeNonConflicting {
        reply: Reply<()>,
    },
    Done {
        reply: Reply<()>,
    },
}

impl SessionOp {
    /// Answer the caller with `err` without touching any session.
    pub(crate) fn reject(self, err: LedgerError) {
        match self {
            Self::Diff { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Merge { reply, .. } | Self::MergeNonConflicting { reply } | Self::Done { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// State of one conflict being negotiated with a resolver.
#[derive(Debug)]
pub struct ResolutionSession {
    key: SessionKey,
    binding: u64,
    conflict: Conflict,
    state: SessionState,
    instructions: BTreeMap<Key, ValueSource>,
}

impl ResolutionSession {
    pub fn new(key: SessionKey, binding: u64, conflict: Conflict) -> Self {
        Self {
            key,
            binding,
            conflict,
            state: SessionState::Open,
            instructions: BTreeMap::new(),
        }
    }

    /// Start from instructions computed before the resolver is involved.
    pub fn seeded(mut self, instructions: BTreeMap<Key, ValueSource>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// The resolver connection this session was delivered on.
    pub fn binding(&self) -> u64 {
        self.binding
    }

    pub fn conflict(&self) -> &Conflict {
        &self.conflict
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Open | SessionState::Merging)
    }

    /// One page of the session's fixed three-way diff.
    pub fn diff(
        &self,
        store: &CommitStore,
        engine: &DiffEngine,
        mode: DiffMode,
        token: Option<&Token>,
    ) -> Result<Paginated<DiffEntry>, LedgerError> {
        self.ensure_active()?;
        let base = store.get_commit(&self.conflict.base)?;
        let left = store.get_commit(&self.conflict.left)?;
        let right = store.get_commit(&self.conflict.right)?;
        Ok(engine.diff(&base, &left, &right, mode, token)?)
    }

    /// Accumulate a batch of instructions. A later instruction for the same
    /// key replaces the earlier one. The batch is rejected as a whole if any
    /// instruction is invalid.
    pub fn merge(&mut self, values: Vec<MergedValue>) -> Result<(), LedgerError> {
        self.ensure_active()?;
        if let Some(bad) = values.iter().position(|v| v.key.is_empty()) {
            return Err(ResolutionError::InvalidInstruction(format!(
                "instruction {bad} has an empty key"
            ))
            .into());
        }
        let count = values.len();
        for value in values {
            self.instructions.insert(value.key, value.source);
        }
        self.state = SessionState::Merging;
        debug!(session = %self.key, count, total = self.instructions.len(), "merge instructions accepted");
        Ok(())
    }

    /// Add every change right made on keys left did not touch.
    pub fn merge_non_conflicting(&mut self, store: &CommitStore) -> Result<(), LedgerError> {
        self.ensure_active()?;
        let base = store.get_commit(&self.conflict.base)?;
        let left = store.get_commit(&self.conflict.left)?;
        let right = store.get_commit(&self.conflict.right)?;
        let seeded = Merger::non_conflicting_instructions(&base, &left, &right);
        let count = seeded.len();
        self.instructions.extend(seeded);
        self.state = SessionState::Merging;
        debug!(session = %self.key, count, "non-conflicting entries merged");
        Ok(())
    }

    /// Build the merge commit and move to `Done`.
    pub fn finish(
        &mut self,
        store: &CommitStore,
        timestamp: DateTime<Utc>,
    ) -> Result<CommitDraft, LedgerError> {
        self.ensure_active()?;
        let left = store.get_commit(&self.conflict.left)?;
        let right = store.get_commit(&self.conflict.right)?;
        let changes = Merger::apply_instructions(&left, &right, &self.instructions);
        self.state = SessionState::Done;
        Ok(Merger::merge_draft(&self.conflict, changes, timestamp))
    }

    pub fn cancel(&mut self) {
        if self.is_active() {
            self.state = SessionState::Cancelled;
        }
    }

    fn ensure_active(&self) -> Result<(), ResolutionError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ResolutionError::SessionClosed(self.key.to_string()))
        }
    }
}
