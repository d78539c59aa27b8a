//! Merge policy coordination for one page.
//!
//! The coordinator holds the page's view of the installed resolver factory:
//! the factory generation, the policy it returned, the live resolver binding
//! and the sessions opened on it. It is owned by the page loop, which feeds
//! it conflicts and routes resolver traffic to it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::detector::Conflict;
use super::merger::Merger;
use super::resolver::{ConflictResolverFactory, MergeResultProvider, ResolveRequest, ResolverBinding};
use super::session::{ResolutionSession, SessionKey, SessionOp};
use crate::commit::{Commit, CommitDraft, CommitStore};
use crate::diff::DiffEngine;
use crate::errors::{LedgerError, ResolutionError};
use crate::models::{CommitId, MergePolicy, PageId};
use crate::page::{PageCommand, PageSender, Reply};
use crate::pagination::PageLimits;
use crate::snapshot::PageSnapshot;

/// Active policy and resolver binding.
enum Strategy {
    /// No policy known for the current factory. `requested` is set while a
    /// `get_policy` call is in flight.
    AwaitingPolicy { requested: bool },
    LastOneWins,
    Custom(ResolverBinding),
    Automatic(ResolverBinding),
}

impl Strategy {
    fn binding(&self) -> Option<&ResolverBinding> {
        match self {
            Self::Custom(binding) | Self::Automatic(binding) => Some(binding),
            _ => None,
        }
    }
}

/// What the page loop should do about a conflict.
#[derive(Debug)]
pub(crate) enum Step {
    /// Append this merge commit, then look at the heads again.
    Commit(CommitDraft),
    /// Nothing to do until a policy or resolver answers.
    Pending,
}

/// Per-page owner of the merge policy and resolution sessions.
pub struct MergeCoordinator {
    page_id: PageId,
    page: PageSender,
    generation: u64,
    factory: Option<Arc<dyn ConflictResolverFactory>>,
    strategy: Strategy,
    sessions: BTreeMap<SessionKey, ResolutionSession>,
    snapshot_limits: PageLimits,
    next_session: u64,
    next_binding: u64,
}

impl MergeCoordinator {
    pub(crate) fn new(
        page_id: PageId,
        page: PageSender,
        generation: u64,
        factory: Option<Arc<dyn ConflictResolverFactory>>,
        snapshot_limits: PageLimits,
    ) -> Self {
        let strategy = match factory {
            Some(_) => Strategy::AwaitingPolicy { requested: false },
            None => Strategy::LastOneWins,
        };
        Self {
            page_id,
            page,
            generation,
            factory,
            strategy,
            sessions: BTreeMap::new(),
            snapshot_limits,
            next_session: 0,
            next_binding: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The policy in force, if one has been obtained.
    pub fn policy(&self) -> Option<MergePolicy> {
        match self.strategy {
            Strategy::AwaitingPolicy { .. } => None,
            Strategy::LastOneWins => Some(MergePolicy::LastOneWins),
            Strategy::Custom(_) => Some(MergePolicy::Custom),
            Strategy::Automatic(_) => Some(MergePolicy::AutomaticWithFallback),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Whether resolution work is outstanding: an open session, or a policy
    /// request that will lead to one.
    pub fn has_pending_work(&self) -> bool {
        !self.sessions.is_empty()
            || matches!(self.strategy, Strategy::AwaitingPolicy { requested: true })
    }

    // -----------------------------------------------------------------------
    // Factory lifecycle
    // -----------------------------------------------------------------------

    /// Install a new factory, or none. Every session of the previous
    /// generation is cancelled and its resolver disconnected before anything
    /// is issued under the new one. Returns `false` for an out-of-date
    /// installation.
    pub(crate) fn set_factory(
        &mut self,
        generation: u64,
        factory: Option<Arc<dyn ConflictResolverFactory>>,
    ) -> bool {
        if generation <= self.generation {
            debug!(page = %self.page_id, generation, current = self.generation, "ignoring old resolver factory");
            return false;
        }
        let cancelled = self.cancel_sessions(|_| true);
        self.strategy = match factory {
            Some(_) => Strategy::AwaitingPolicy { requested: false },
            None => Strategy::LastOneWins,
        };
        self.factory = factory;
        self.generation = generation;
        info!(
            page = %self.page_id,
            generation,
            cancelled,
            has_factory = self.factory.is_some(),
            "resolver factory replaced"
        );
        true
    }

    /// Apply the answer to a `get_policy` call. Answers for an older
    /// generation are dropped.
    pub(crate) fn on_policy(&mut self, generation: u64, policy: MergePolicy) -> bool {
        if generation != self.generation {
            warn!(page = %self.page_id, generation, current = self.generation, "discarding stale policy");
            return false;
        }
        if !matches!(self.strategy, Strategy::AwaitingPolicy { requested: true }) {
            debug!(page = %self.page_id, %policy, "policy not awaited");
            return false;
        }
        let Some(factory) = self.factory.clone() else {
            self.strategy = Strategy::LastOneWins;
            return true;
        };
        self.strategy = match policy {
            MergePolicy::LastOneWins => Strategy::LastOneWins,
            MergePolicy::Custom => Strategy::Custom(self.connect(factory.as_ref())),
            MergePolicy::AutomaticWithFallback => {
                Strategy::Automatic(self.connect(factory.as_ref()))
            }
        };
        info!(page = %self.page_id, generation, %policy, "merge policy set");
        true
    }

    /// The resolver behind `binding` went away. Its sessions are cancelled
    /// and the policy will be asked for again at the next conflict.
    pub(crate) fn on_resolver_disconnected(&mut self, binding: u64) -> bool {
        if self.strategy.binding().map(ResolverBinding::id) != Some(binding) {
            debug!(page = %self.page_id, binding, "disconnect of inactive resolver");
            return false;
        }
        let cancelled = self.cancel_sessions(|session| session.binding() == binding);
        self.strategy = Strategy::AwaitingPolicy { requested: false };
        warn!(page = %self.page_id, binding, cancelled, "conflict resolver disconnected");
        true
    }

    /// A resolver dropped its result provider without finishing.
    pub(crate) fn on_provider_dropped(&mut self, key: SessionKey) -> bool {
        match self.sessions.remove(&key) {
            Some(mut session) => {
                session.cancel();
                warn!(page = %self.page_id, session = %key, "resolver abandoned session");
                true
            }
            None => false,
        }
    }

    /// Tear everything down, as when the page is deleted.
    pub(crate) fn shutdown(&mut self) {
        let cancelled = self.cancel_sessions(|_| true);
        self.strategy = Strategy::AwaitingPolicy { requested: false };
        self.factory = None;
        debug!(page = %self.page_id, cancelled, "coordinator shut down");
    }

    // -----------------------------------------------------------------------
    // Conflict handling
    // -----------------------------------------------------------------------

    /// Decide what to do about `conflict` under the current policy.
    pub(crate) fn step(
        &mut self,
        conflict: &Conflict,
        store: &CommitStore,
    ) -> Result<Step, LedgerError> {
        if !self.sessions.is_empty() {
            return Ok(Step::Pending);
        }

        match &self.strategy {
            Strategy::AwaitingPolicy { requested: true } => Ok(Step::Pending),
            Strategy::AwaitingPolicy { requested: false } => {
                self.request_policy();
                match self.strategy {
                    // No factory to ask.
                    Strategy::LastOneWins => self.step(conflict, store),
                    _ => Ok(Step::Pending),
                }
            }
            Strategy::LastOneWins => {
                let (base, left, right) = commits(conflict, store)?;
                let changes = Merger::last_one_wins(&base, &left, &right);
                debug!(page = %self.page_id, %conflict, changes = changes.len(), "last one wins");
                Ok(Step::Commit(Merger::merge_draft(
                    conflict,
                    changes,
                    store.next_timestamp(),
                )))
            }
            Strategy::Automatic(_) => {
                let (base, left, right) = commits(conflict, store)?;
                if let Some(changes) = Merger::automatic(&base, &left, &right) {
                    debug!(page = %self.page_id, %conflict, changes = changes.len(), "merged automatically");
                    return Ok(Step::Commit(Merger::merge_draft(
                        conflict,
                        changes,
                        store.next_timestamp(),
                    )));
                }
                let seeded = Merger::non_conflicting_instructions(&base, &left, &right);
                let session = self.new_session(conflict).seeded(seeded);
                self.deliver(session, store)
            }
            Strategy::Custom(_) => {
                let session = self.new_session(conflict);
                self.deliver(session, store)
            }
        }
    }

    /// Route a resolver call to its session. A successful `done` hands back
    /// the merge commit to append together with the caller to answer.
    pub(crate) fn handle_session_op(
        &mut self,
        key: SessionKey,
        op: SessionOp,
        store: &CommitStore,
        engine: &DiffEngine,
    ) -> Option<(CommitDraft, Reply<()>)> {
        if key.generation != self.generation {
            warn!(page = %self.page_id, session = %key, "rejecting call from stale resolver");
            op.reject(
                ResolutionError::StaleGeneration {
                    session: key.to_string(),
                    generation: key.generation,
                }
                .into(),
            );
            return None;
        }
        let Some(session) = self.sessions.get_mut(&key) else {
            op.reject(ResolutionError::SessionClosed(key.to_string()).into());
            return None;
        };

        match op {
            SessionOp::Diff { mode, token, reply } => {
                let _ = reply.send(session.diff(store, engine, mode, token.as_ref()));
                None
            }
            SessionOp::Merge { values, reply } => {
                let _ = reply.send(session.merge(values));
                None
            }
            SessionOp::MergeNonConflicting { reply } => {
                let _ = reply.send(session.merge_non_conflicting(store));
                None
            }
            SessionOp::Done { reply } => {
                let finished = session.finish(store, store.next_timestamp());
                match finished {
                    Ok(draft) => {
                        self.sessions.remove(&key);
                        info!(page = %self.page_id, session = %key, "resolver finished merge");
                        Some((draft, reply))
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        None
                    }
                }
            }
        }
    }

    fn request_policy(&mut self) {
        let Some(factory) = &self.factory else {
            self.strategy = Strategy::LastOneWins;
            return;
        };
        let policy = factory.get_policy(&self.page_id);
        let page = self.page.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let policy = policy.await;
            let _ = page.send(PageCommand::PolicyReady { generation, policy });
        });
        self.strategy = Strategy::AwaitingPolicy { requested: true };
        debug!(page = %self.page_id, generation, "requested merge policy");
    }

    fn connect(&mut self, factory: &dyn ConflictResolverFactory) -> ResolverBinding {
        self.next_binding += 1;
        ResolverBinding::connect(self.next_binding, &self.page_id, factory, self.page.clone())
    }

    fn new_session(&mut self, conflict: &Conflict) -> ResolutionSession {
        self.next_session += 1;
        let key = SessionKey {
            generation: self.generation,
            seq: self.next_session,
        };
        let binding = self.strategy.binding().map_or(0, ResolverBinding::id);
        ResolutionSession::new(key, binding, conflict.clone())
    }

    fn deliver(
        &mut self,
        session: ResolutionSession,
        store: &CommitStore,
    ) -> Result<Step, LedgerError> {
        let conflict = session.conflict();
        let key = session.key();
        let request = ResolveRequest {
            left: self.snapshot(store, &conflict.left)?,
            right: self.snapshot(store, &conflict.right)?,
            common: self.snapshot(store, &conflict.base)?,
            result_provider: MergeResultProvider::new(self.page_id.clone(), key, self.page.clone()),
        };

        let sent = match self.strategy.binding() {
            Some(binding) => binding.send(request).map_err(|_| binding.id()),
            None => return Ok(Step::Pending),
        };
        match sent {
            Ok(()) => {
                info!(page = %self.page_id, session = %key, conflict = %session.conflict(), "conflict sent to resolver");
                self.sessions.insert(key, session);
            }
            Err(binding) => {
                self.on_resolver_disconnected(binding);
                self.request_policy();
            }
        }
        Ok(Step::Pending)
    }

    fn snapshot(&self, store: &CommitStore, id: &CommitId) -> Result<PageSnapshot, LedgerError> {
        let commit = store.get_commit(id)?;
        Ok(PageSnapshot::new(
            self.page_id.clone(),
            commit,
            self.snapshot_limits,
        ))
    }

    fn cancel_sessions(&mut self, matches: impl Fn(&ResolutionSession) -> bool) -> usize {
        let keys: HashSet<SessionKey> = self
            .sessions
            .values()
            .filter(|s| matches(s))
            .map(ResolutionSession::key)
            .collect();
        for key in &keys {
            if let Some(mut session) = self.sessions.remove(key) {
                session.cancel();
                debug!(page = %self.page_id, session = %key, state = %session.state(), "session cancelled");
            }
        }
        keys.len()
    }
}

type Triple = (Arc<Commit>, Arc<Commit>, Arc<Commit>);

/// Base, left and right commits of a conflict.
fn commits(conflict: &Conflict, store: &CommitStore) -> Result<Triple, LedgerError> {
    Ok((
        store.get_commit(&conflict.base)?,
        store.get_commit(&conflict.left)?,
        store.get_commit(&conflict.right)?,
    ))
}
