//! Per-page event loop and connection handles.
//!
//! Every page runs one task that owns its commit store, head set, merge
//! coordinator and watchers. Connections, resolvers and watchers talk to it
//! through a single command queue, so appends, head recomputation and
//! session state changes for a page never interleave.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::commit::{Commit, CommitDraft, CommitStore, HeadTracker, HeadsChanged};
use crate::config::PageSettings;
use crate::conflict::coordinator::{MergeCoordinator, Step};
use crate::conflict::detector::recency;
use crate::conflict::session::{SessionKey, SessionOp};
use crate::conflict::{ConflictDetector, ConflictResolverFactory};
use crate::diff::DiffEngine;
use crate::errors::{LedgerError, PageError};
use crate::models::{
    CommitId, ConflictResolutionWaitStatus, DiffEntry, DiffMode, Entry, EntryChange, Key,
    MergePolicy, PageId, Paginated, Token, Value,
};
use crate::snapshot::PageSnapshot;
use crate::storage::PageStorage;
use crate::watcher::{PageWatcher, WatcherNotifier};

pub(crate) type PageSender = mpsc::UnboundedSender<PageCommand>;
pub(crate) type Reply<T> = oneshot::Sender<Result<T, LedgerError>>;

/// Everything the page loop reacts to.
pub(crate) enum PageCommand {
    Connect {
        reply: Reply<u64>,
    },
    Disconnect {
        connection: u64,
    },
    Put {
        connection: u64,
        key: Key,
        value: Value,
        reply: Reply<()>,
    },
    Delete {
        connection: u64,
        key: Key,
        reply: Reply<()>,
    },
    StartTransaction {
        connection: u64,
        reply: Reply<()>,
    },
    Commit {
        connection: u64,
        reply: Reply<()>,
    },
    Rollback {
        connection: u64,
        reply: Reply<()>,
    },
    Snapshot {
        connection: u64,
        reply: Reply<PageSnapshot>,
    },
    Watch {
        connection: u64,
        reply: Reply<(PageSnapshot, PageWatcher)>,
    },
    AddRemoteCommit {
        parent: CommitId,
        timestamp: DateTime<Utc>,
        changes: Vec<EntryChange>,
        reply: Reply<CommitId>,
    },
    Heads {
        reply: Reply<Vec<CommitId>>,
    },
    Log {
        reply: Reply<Vec<Arc<Commit>>>,
    },
    GetCommit {
        id: CommitId,
        reply: Reply<Arc<Commit>>,
    },
    Entries {
        id: CommitId,
        token: Option<Token>,
        reply: Reply<Paginated<Entry>>,
    },
    MergeBase {
        left: CommitId,
        right: CommitId,
        reply: Reply<CommitId>,
    },
    Diff {
        left: CommitId,
        right: CommitId,
        mode: DiffMode,
        token: Option<Token>,
        reply: Reply<Paginated<DiffEntry>>,
    },
    Status {
        reply: Reply<PageStatus>,
    },
    WaitForConflictResolution {
        reply: Reply<ConflictResolutionWaitStatus>,
    },
    SetResolverFactory {
        generation: u64,
        factory: Option<Arc<dyn ConflictResolverFactory>>,
    },
    PolicyReady {
        generation: u64,
        policy: MergePolicy,
    },
    ResolverDisconnected {
        binding: u64,
    },
    Session {
        key: SessionKey,
        op: SessionOp,
    },
    ProviderDropped {
        key: SessionKey,
    },
    WatcherAck {
        watcher: u64,
    },
    Destroy {
        reply: Reply<()>,
    },
    Shutdown,
}

/// Point-in-time summary of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStatus {
    pub heads: Vec<CommitId>,
    pub commits: usize,
    pub policy: Option<MergePolicy>,
    pub resolver_generation: u64,
    pub active_sessions: usize,
    pub watchers: usize,
    pub connections: usize,
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Uncommitted changes of a connection's transaction.
struct Journal {
    base: Arc<Commit>,
    changes: BTreeMap<Key, Option<Value>>,
}

struct Connection {
    /// The commit this connection reads from and builds on.
    commit: Arc<Commit>,
    journal: Option<Journal>,
}

pub(crate) struct PageLoop {
    id: PageId,
    rx: mpsc::UnboundedReceiver<PageCommand>,
    storage: Arc<dyn PageStorage>,
    store: CommitStore,
    heads: HeadTracker,
    engine: DiffEngine,
    coordinator: MergeCoordinator,
    watchers: WatcherNotifier,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    waiters: Vec<Reply<ConflictResolutionWaitStatus>>,
}

impl PageLoop {
    /// Load the page and start its loop.
    pub(crate) fn spawn(
        id: PageId,
        storage: Arc<dyn PageStorage>,
        settings: PageSettings,
        generation: u64,
        factory: Option<Arc<dyn ConflictResolverFactory>>,
    ) -> Result<PageSender, LedgerError> {
        let store = CommitStore::open(id.clone(), storage.clone(), settings.entries)?;
        let heads = HeadTracker::from_store(&store);
        let (tx, rx) = mpsc::unbounded_channel();

        let page = Self {
            coordinator: MergeCoordinator::new(
                id.clone(),
                tx.clone(),
                generation,
                factory,
                settings.entries,
            ),
            watchers: WatcherNotifier::new(
                id.clone(),
                tx.clone(),
                settings.change_page_size,
                settings.entries,
            ),
            engine: DiffEngine::new(settings.diff),
            id,
            rx,
            storage,
            store,
            heads,
            connections: HashMap::new(),
            next_connection: 0,
            waiters: Vec::new(),
        };
        info!(page = %page.id, heads = page.heads.len(), commits = page.store.len(), "page loop started");
        tokio::spawn(page.run());
        Ok(tx)
    }

    async fn run(mut self) {
        self.resolve();
        while let Some(command) = self.rx.recv().await {
            match command {
                PageCommand::Destroy { reply } => {
                    let _ = reply.send(self.destroy());
                    break;
                }
                PageCommand::Shutdown => {
                    self.coordinator.shutdown();
                    break;
                }
                command => self.handle(command),
            }
            self.answer_waiters();
        }
        info!(page = %self.id, "page loop stopped");
    }

    fn handle(&mut self, command: PageCommand) {
        match command {
            PageCommand::Connect { reply } => {
                self.next_connection += 1;
                let commit = self.current_head();
                self.connections.insert(
                    self.next_connection,
                    Connection {
                        commit,
                        journal: None,
                    },
                );
                debug!(page = %self.id, connection = self.next_connection, "connection opened");
                let _ = reply.send(Ok(self.next_connection));
            }
            PageCommand::Disconnect { connection } => {
                if let Some(conn) = self.connections.remove(&connection) {
                    if conn.journal.is_some() {
                        debug!(page = %self.id, connection, "open transaction rolled back");
                    }
                }
            }
            PageCommand::Put {
                connection,
                key,
                value,
                reply,
            } => {
                let _ = reply.send(self.mutate(connection, key, Some(value)));
            }
            PageCommand::Delete {
                connection,
                key,
                reply,
            } => {
                let _ = reply.send(self.mutate(connection, key, None));
            }
            PageCommand::StartTransaction { connection, reply } => {
                let _ = reply.send(self.start_transaction(connection));
            }
            PageCommand::Commit { connection, reply } => {
                let _ = reply.send(self.commit_transaction(connection));
            }
            PageCommand::Rollback { connection, reply } => {
                let result = self.connection(connection).and_then(|conn| {
                    conn.journal
                        .take()
                        .map(|_| ())
                        .ok_or_else(|| PageError::NoTransaction.into())
                });
                let _ = reply.send(result);
            }
            PageCommand::Snapshot { connection, reply } => {
                let result = self.snapshot(connection);
                let _ = reply.send(result);
            }
            PageCommand::Watch { connection, reply } => {
                let result = self.snapshot(connection).map(|snapshot| {
                    let from = self
                        .store
                        .get_commit(snapshot.commit_id())
                        .unwrap_or_else(|_| self.store.root().clone());
                    let watcher = self.watchers.register(from);
                    (snapshot, watcher)
                });
                let _ = reply.send(result);
            }
            PageCommand::AddRemoteCommit {
                parent,
                timestamp,
                changes,
                reply,
            } => {
                let draft = CommitDraft {
                    parents: vec![parent],
                    timestamp,
                    changes,
                };
                let result = self.append(draft).map(|(commit, changed)| {
                    self.on_heads_changed(changed);
                    commit.id().clone()
                });
                let _ = reply.send(result);
            }
            PageCommand::Heads { reply } => {
                let _ = reply.send(Ok(self.heads.current_heads()));
            }
            PageCommand::Log { reply } => {
                let _ = reply.send(Ok(self.store.log()));
            }
            PageCommand::GetCommit { id, reply } => {
                let _ = reply.send(self.store.get_commit(&id).map_err(Into::into));
            }
            PageCommand::Entries { id, token, reply } => {
                let _ = reply.send(self.store.get_entries(&id, token.as_ref()));
            }
            PageCommand::MergeBase { left, right, reply } => {
                let _ = reply.send(self.store.merge_base(&left, &right).map_err(Into::into));
            }
            PageCommand::Diff {
                left,
                right,
                mode,
                token,
                reply,
            } => {
                let _ = reply.send(self.diff(&left, &right, mode, token.as_ref()));
            }
            PageCommand::Status { reply } => {
                let _ = reply.send(Ok(PageStatus {
                    heads: self.heads.current_heads(),
                    commits: self.store.len(),
                    policy: self.coordinator.policy(),
                    resolver_generation: self.coordinator.generation(),
                    active_sessions: self.coordinator.active_sessions(),
                    watchers: self.watchers.len(),
                    connections: self.connections.len(),
                }));
            }
            PageCommand::WaitForConflictResolution { reply } => {
                if self.coordinator.has_pending_work() {
                    self.waiters.push(reply);
                } else {
                    let _ = reply.send(Ok(ConflictResolutionWaitStatus::NoConflicts));
                }
            }
            PageCommand::SetResolverFactory {
                generation,
                factory,
            } => {
                if self.coordinator.set_factory(generation, factory) {
                    self.resolve();
                }
            }
            PageCommand::PolicyReady { generation, policy } => {
                if self.coordinator.on_policy(generation, policy) {
                    self.resolve();
                }
            }
            PageCommand::ResolverDisconnected { binding } => {
                if self.coordinator.on_resolver_disconnected(binding) {
                    self.resolve();
                }
            }
            PageCommand::Session { key, op } => {
                let finished =
                    self.coordinator
                        .handle_session_op(key, op, &self.store, &self.engine);
                if let Some((draft, reply)) = finished {
                    match self.append(draft) {
                        Ok((_, changed)) => {
                            let _ = reply.send(Ok(()));
                            self.on_heads_changed(changed);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            self.resolve();
                        }
                    }
                }
            }
            PageCommand::ProviderDropped { key } => {
                if self.coordinator.on_provider_dropped(key) {
                    self.resolve();
                }
            }
            PageCommand::WatcherAck { watcher } => self.watchers.on_ack(watcher),
            PageCommand::Destroy { .. } | PageCommand::Shutdown => {}
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn mutate(
        &mut self,
        connection: u64,
        key: Key,
        value: Option<Value>,
    ) -> Result<(), LedgerError> {
        if key.is_empty() {
            return Err(PageError::InvalidKey("key must not be empty".into()).into());
        }
        let conn = self.connection(connection)?;
        if let Some(journal) = conn.journal.as_mut() {
            journal.changes.insert(key, value);
            return Ok(());
        }
        let base = conn.commit.clone();
        self.commit_changes(connection, base, BTreeMap::from([(key, value)]))
    }

    fn start_transaction(&mut self, connection: u64) -> Result<(), LedgerError> {
        let conn = self.connection(connection)?;
        if conn.journal.is_some() {
            return Err(PageError::TransactionInProgress.into());
        }
        conn.journal = Some(Journal {
            base: conn.commit.clone(),
            changes: BTreeMap::new(),
        });
        Ok(())
    }

    fn commit_transaction(&mut self, connection: u64) -> Result<(), LedgerError> {
        let journal = self
            .connection(connection)?
            .journal
            .take()
            .ok_or(PageError::NoTransaction)?;
        self.commit_changes(connection, journal.base, journal.changes)
    }

    /// Commit `changes` on top of `base` for `connection`. Changes that
    /// leave a key as it already is in `base` are dropped, and nothing is
    /// committed if none remain.
    fn commit_changes(
        &mut self,
        connection: u64,
        base: Arc<Commit>,
        changes: BTreeMap<Key, Option<Value>>,
    ) -> Result<(), LedgerError> {
        let changes: Vec<EntryChange> = changes
            .into_iter()
            .filter(|(key, value)| base.get(key) != value.as_ref())
            .map(|(key, value)| EntryChange { key, value })
            .collect();
        if changes.is_empty() {
            debug!(page = %self.id, connection, "nothing to commit");
            return Ok(());
        }

        let draft = CommitDraft {
            parents: vec![base.id().clone()],
            timestamp: self.store.next_timestamp(),
            changes,
        };
        let (commit, changed) = self.append(draft)?;
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.commit = commit;
        }
        self.on_heads_changed(changed);
        Ok(())
    }

    fn append(
        &mut self,
        draft: CommitDraft,
    ) -> Result<(Arc<Commit>, Option<HeadsChanged>), LedgerError> {
        let commit = self.store.append(draft)?;
        let changed = self.heads.on_append(&commit, &self.store)?;
        Ok((commit, changed))
    }

    // -----------------------------------------------------------------------
    // Heads and resolution
    // -----------------------------------------------------------------------

    /// The only entry point for head-set transitions: a single head is
    /// published, several heads go to the coordinator.
    fn on_heads_changed(&mut self, changed: Option<HeadsChanged>) {
        match changed {
            Some(changed) if changed.is_conflicted() => self.resolve(),
            Some(changed) => self.publish(&changed.appended),
            None => {}
        }
    }

    /// Move connections that are not in a transaction to `head` and notify
    /// watchers.
    fn publish(&mut self, head: &CommitId) {
        let head = match self.store.get_commit(head) {
            Ok(head) => head,
            Err(e) => {
                error!(page = %self.id, error = %e, "head missing from store");
                return;
            }
        };
        for conn in self.connections.values_mut() {
            if conn.journal.is_none() {
                conn.commit = head.clone();
            }
        }
        self.watchers.on_new_head(&head, &self.engine);
    }

    /// Merge heads pairwise as far as the current policy allows.
    fn resolve(&mut self) {
        while self.heads.is_conflicted() {
            let conflict =
                match ConflictDetector::detect(&self.heads.current_heads(), &self.store) {
                    Ok(Some(conflict)) => conflict,
                    Ok(None) => return,
                    Err(e) => {
                        error!(page = %self.id, error = %e, "conflict detection failed");
                        return;
                    }
                };

            let draft = match self.coordinator.step(&conflict, &self.store) {
                Ok(Step::Commit(draft)) => draft,
                Ok(Step::Pending) => return,
                Err(e) => {
                    error!(page = %self.id, %conflict, error = %e, "merge failed");
                    return;
                }
            };
            match self.append(draft) {
                Ok((_, Some(changed))) if !changed.is_conflicted() => {
                    self.publish(&changed.appended);
                    return;
                }
                Ok((_, Some(_))) => {}
                Ok((commit, None)) => {
                    warn!(page = %self.id, commit = commit.id().short(), "merge commit left heads unchanged");
                    return;
                }
                Err(e) => {
                    error!(page = %self.id, %conflict, error = %e, "merge commit rejected");
                    return;
                }
            }
        }
    }

    fn answer_waiters(&mut self) {
        if self.waiters.is_empty() || self.coordinator.has_pending_work() {
            return;
        }
        debug!(page = %self.id, waiters = self.waiters.len(), "conflicts resolved");
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(ConflictResolutionWaitStatus::ConflictsResolved));
        }
    }

    fn destroy(&mut self) -> Result<(), LedgerError> {
        self.coordinator.shutdown();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(LedgerError::page_gone(&self.id)));
        }
        self.storage.delete_page(&self.id)?;
        info!(page = %self.id, "page deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn connection(&mut self, connection: u64) -> Result<&mut Connection, LedgerError> {
        self.connections
            .get_mut(&connection)
            .ok_or_else(|| LedgerError::page_gone(&self.id))
    }

    fn current_head(&self) -> Arc<Commit> {
        let newest = self
            .heads
            .current_heads()
            .into_iter()
            .filter_map(|id| self.store.get_commit(&id).ok())
            .max_by(|a, b| recency(a, b));
        newest.unwrap_or_else(|| self.store.root().clone())
    }

    fn snapshot(&mut self, connection: u64) -> Result<PageSnapshot, LedgerError> {
        let id = self.id.clone();
        let limits = self.store.entries_limits();
        let conn = self.connection(connection)?;
        let commit = match &conn.journal {
            Some(journal) => journal.base.clone(),
            None => conn.commit.clone(),
        };
        Ok(PageSnapshot::new(id, commit, limits))
    }

    fn diff(
        &self,
        left: &CommitId,
        right: &CommitId,
        mode: DiffMode,
        token: Option<&Token>,
    ) -> Result<Paginated<DiffEntry>, LedgerError> {
        let base = self.store.merge_base(left, right)?;
        let base = self.store.get_commit(&base)?;
        let left = self.store.get_commit(left)?;
        let right = self.store.get_commit(right)?;
        Ok(self.engine.diff(&base, &left, &right, mode, token)?)
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// A connection to a page.
///
/// Each handle tracks its own commit: outside a transaction it follows the
/// page head whenever the page has a single head. Dropping the handle closes
/// the connection and discards any open transaction.
pub struct Page {
    id: PageId,
    connection: u64,
    sender: PageSender,
}

impl Page {
    pub(crate) async fn connect(id: PageId, sender: PageSender) -> Result<Self, LedgerError> {
        let connection = request(&id, &sender, |reply| PageCommand::Connect { reply }).await?;
        Ok(Self {
            id,
            connection,
            sender,
        })
    }

    pub fn id(&self) -> &PageId {
        &self.id
    }

    /// Set `key` to `value`, committing immediately unless a transaction is
    /// open.
    pub async fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<(), LedgerError> {
        let (key, value) = (key.into(), value.into());
        self.call(|connection, reply| PageCommand::Put {
            connection,
            key,
            value,
            reply,
        })
        .await
    }

    pub async fn delete(&self, key: impl Into<Key>) -> Result<(), LedgerError> {
        let key = key.into();
        self.call(|connection, reply| PageCommand::Delete {
            connection,
            key,
            reply,
        })
        .await
    }

    pub async fn start_transaction(&self) -> Result<(), LedgerError> {
        self.call(|connection, reply| PageCommand::StartTransaction { connection, reply })
            .await
    }

    pub async fn commit(&self) -> Result<(), LedgerError> {
        self.call(|connection, reply| PageCommand::Commit { connection, reply })
            .await
    }

    pub async fn rollback(&self) -> Result<(), LedgerError> {
        self.call(|connection, reply| PageCommand::Rollback { connection, reply })
            .await
    }

    /// The page as this connection currently sees it.
    pub async fn get_snapshot(&self) -> Result<PageSnapshot, LedgerError> {
        self.call(|connection, reply| PageCommand::Snapshot { connection, reply })
            .await
    }

    /// A snapshot plus a watcher that reports every change after it.
    pub async fn watch(&self) -> Result<(PageSnapshot, PageWatcher), LedgerError> {
        self.call(|connection, reply| PageCommand::Watch { connection, reply })
            .await
    }

    /// Add a commit produced elsewhere on top of `parent`.
    pub async fn add_remote_commit(
        &self,
        parent: &CommitId,
        mut changes: Vec<EntryChange>,
        timestamp: DateTime<Utc>,
    ) -> Result<CommitId, LedgerError> {
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        let parent = parent.clone();
        self.call(|_, reply| PageCommand::AddRemoteCommit {
            parent,
            timestamp,
            changes,
            reply,
        })
        .await
    }

    pub async fn heads(&self) -> Result<Vec<CommitId>, LedgerError> {
        self.call(|_, reply| PageCommand::Heads { reply }).await
    }

    /// Every commit of the page, oldest first.
    pub async fn log(&self) -> Result<Vec<Arc<Commit>>, LedgerError> {
        self.call(|_, reply| PageCommand::Log { reply }).await
    }

    pub async fn get_commit(&self, id: &CommitId) -> Result<Arc<Commit>, LedgerError> {
        let id = id.clone();
        self.call(|_, reply| PageCommand::GetCommit { id, reply })
            .await
    }

    /// One page of a commit's entries.
    pub async fn get_entries(
        &self,
        id: &CommitId,
        token: Option<&Token>,
    ) -> Result<Paginated<Entry>, LedgerError> {
        let (id, token) = (id.clone(), token.cloned());
        self.call(|_, reply| PageCommand::Entries { id, token, reply })
            .await
    }

    pub async fn merge_base(
        &self,
        left: &CommitId,
        right: &CommitId,
    ) -> Result<CommitId, LedgerError> {
        let (left, right) = (left.clone(), right.clone());
        self.call(|_, reply| PageCommand::MergeBase { left, right, reply })
            .await
    }

    /// One page of the three-way diff of two commits against their merge
    /// base.
    pub async fn diff(
        &self,
        left: &CommitId,
        right: &CommitId,
        mode: DiffMode,
        token: Option<&Token>,
    ) -> Result<Paginated<DiffEntry>, LedgerError> {
        let (left, right, token) = (left.clone(), right.clone(), token.cloned());
        self.call(|_, reply| PageCommand::Diff {
            left,
            right,
            mode,
            token,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<PageStatus, LedgerError> {
        self.call(|_, reply| PageCommand::Status { reply }).await
    }

    /// Resolves at once with `NoConflicts` if no resolution is in progress,
    /// otherwise with `ConflictsResolved` once it is over.
    pub async fn wait_for_conflict_resolution(
        &self,
    ) -> Result<ConflictResolutionWaitStatus, LedgerError> {
        self.call(|_, reply| PageCommand::WaitForConflictResolution { reply })
            .await
    }

    async fn call<T, F>(&self, command: F) -> Result<T, LedgerError>
    where
        F: FnOnce(u64, Reply<T>) -> PageCommand,
    {
        let connection = self.connection;
        request(&self.id, &self.sender, |reply| command(connection, reply)).await
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let _ = self.sender.send(PageCommand::Disconnect {
            connection: self.connection,
        });
    }
}

/// Send a command and wait for its reply. A page whose loop has stopped
/// answers `NOT_FOUND`.
pub(crate) async fn request<T, F>(
    id: &PageId,
    sender: &PageSender,
    command: F,
) -> Result<T, LedgerError>
where
    F: FnOnce(Reply<T>) -> PageCommand,
{
    let (tx, rx) = oneshot::channel();
    sender
        .send(command(tx))
        .map_err(|_| LedgerError::page_gone(id))?;
    match rx.await {
        Ok(result) => result,
        Err(_) => {
            warn!(page = %id, "page stopped before replying");
            Err(LedgerError::page_gone(id))
        }
    }
}
