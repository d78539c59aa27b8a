//! Channels between a page's merge coordinator and external resolvers.
//!
//! A [`ConflictResolverFactory`] is installed on a ledger. For each page that
//! needs one, the coordinator asks it for the page's [`MergePolicy`] and, for
//! policies that may delegate, hands it a [`ResolverRequest`]: the receiving
//! end of a resolver connection. The resolver then gets one
//! [`ResolveRequest`] per conflict and answers through its
//! [`MergeResultProvider`]. Dropping the `ResolverRequest` disconnects the
//! resolver; dropping a provider before `done` abandons that conflict.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::session::{SessionKey, SessionOp};
use crate::errors::{LedgerError, ResolutionError};
use crate::models::{DiffEntry, DiffMode, MergePolicy, MergedValue, PageId, Paginated, Token};
use crate::page::{PageCommand, PageSender, Reply};
use crate::snapshot::PageSnapshot;

/// Future returned by [`ConflictResolverFactory::get_policy`].
pub type PolicyFuture = Pin<Box<dyn Future<Output = MergePolicy> + Send + 'static>>;

/// Supplies merge policies and resolvers for the pages of a ledger.
pub trait ConflictResolverFactory: Send + Sync {
    /// The policy for `page_id`. Asked once per installation of the factory
    /// on a page, at its first conflict, and again after the page's resolver
    /// disconnects. The future may take as long as it likes.
    fn get_policy(&self, page_id: &PageId) -> PolicyFuture;

    /// Bind a resolver to `request`. The resolver stays connected for as long
    /// as `request` is alive.
    fn new_conflict_resolver(&self, page_id: &PageId, request: ResolverRequest);
}

// ---------------------------------------------------------------------------
// Resolver side
// ---------------------------------------------------------------------------

/// The resolver end of a connection.
pub struct ResolverRequest {
    page_id: PageId,
    requests: mpsc::UnboundedReceiver<ResolveRequest>,
    _alive: oneshot::Sender<()>,
}

impl ResolverRequest {
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// The next conflict, or `None` once the coordinator has dropped this
    /// connection (resolver replaced, page deleted or ledger shut down).
    pub async fn recv(&mut self) -> Option<ResolveRequest> {
        self.requests.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ResolveRequest> {
        self.requests.try_recv().ok()
    }
}

/// One conflict to resolve: the two heads, their merge base, and the channel
/// to answer through.
pub struct ResolveRequest {
    pub left: PageSnapshot,
    pub right: PageSnapshot,
    pub common: PageSnapshot,
    pub result_provider: MergeResultProvider,
}

/// Resolver-facing handle on one resolution session.
///
/// Every call is routed through the page's event loop. Once the page is
/// deleted, calls fail with `NOT_FOUND`; once the session is finished or
/// cancelled, they fail with a protocol error.
pub struct MergeResultProvider {
    page_id: PageId,
    session: SessionKey,
    page: PageSender,
}

impl MergeResultProvider {
    pub(crate) fn new(page_id: PageId, session: SessionKey, page: PageSender) -> Self {
        Self {
            page_id,
            session,
            page,
        }
    }

    pub fn session(&self) -> SessionKey {
        self.session
    }

    /// One page of the full three-way diff.
    pub async fn get_full_diff(
        &self,
        token: Option<&Token>,
    ) -> Result<Paginated<DiffEntry>, LedgerError> {
        let token = token.cloned();
        self.call(|reply| SessionOp::Diff {
            mode: DiffMode::Full,
            token,
            reply,
        })
        .await
    }

    /// One page of the keys both heads changed to different values.
    pub async fn get_conflicting_diff(
        &self,
        token: Option<&Token>,
    ) -> Result<Paginated<DiffEntry>, LedgerError> {
        let token = token.cloned();
        self.call(|reply| SessionOp::Diff {
            mode: DiffMode::ConflictingOnly,
            token,
            reply,
        })
        .await
    }

    /// Submit a batch of merge instructions. May be called repeatedly.
    pub async fn merge(&self, values: Vec<MergedValue>) -> Result<(), LedgerError> {
        self.call(|reply| SessionOp::Merge { values, reply }).await
    }

    /// Take every change made by only one side.
    pub async fn merge_non_conflicting_entries(&self) -> Result<(), LedgerError> {
        self.call(|reply| SessionOp::MergeNonConflicting { reply })
            .await
    }

    /// Commit the merge. Succeeds once the merge commit is appended.
    pub async fn done(&self) -> Result<(), LedgerError> {
        self.call(|reply| SessionOp::Done { reply }).await
    }

    async fn call<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(Reply<T>) -> SessionOp,
    {
        let (tx, rx) = oneshot::channel();
        self.page
            .send(PageCommand::Session {
                key: self.session,
                op: op(tx),
            })
            .map_err(|_| LedgerError::page_gone(&self.page_id))?;
        rx.await
            .map_err(|_| LedgerError::page_gone(&self.page_id))?
    }
}

impl Drop for MergeResultProvider {
    fn drop(&mut self) {
        let _ = self
            .page
            .send(PageCommand::ProviderDropped { key: self.session });
    }
}

// ---------------------------------------------------------------------------
// Coordinator side
// ---------------------------------------------------------------------------

/// The coordinator end of a connection. Dropping it disconnects the resolver.
pub(crate) struct ResolverBinding {
    id: u64,
    requests: mpsc::UnboundedSender<ResolveRequest>,
    watch: JoinHandle<()>,
}

impl ResolverBinding {
    /// Ask `factory` for a resolver and watch for it going away.
    pub(crate) fn connect(
        id: u64,
        page_id: &PageId,
        factory: &dyn ConflictResolverFactory,
        page: PageSender,
    ) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let (alive, closed) = oneshot::channel::<()>();
        factory.new_conflict_resolver(
            page_id,
            ResolverRequest {
                page_id: page_id.clone(),
                requests: rx,
                _alive: alive,
            },
        );

        let watched = page_id.clone();
        let watch = tokio::spawn(async move {
            let _ = closed.await;
            debug!(page = %watched, binding = id, "resolver connection closed");
            let _ = page.send(PageCommand::ResolverDisconnected { binding: id });
        });

        Self {
            id,
            requests,
            watch,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn send(&self, request: ResolveRequest) -> Result<(), ResolutionError> {
        self.requests.send(request).map_err(|_| {
            warn!(binding = self.id, "resolver gone before request delivery");
            ResolutionError::ResolverDisconnected
        })
    }
}

impl Drop for ResolverBinding {
    fn drop(&mut self) {
        self.watch.abort();
    }
}

// ---------------------------------------------------------------------------
// Fixed-policy factory
// ---------------------------------------------------------------------------

/// A factory that applies one policy to every page. Conflicts delegated to
/// its resolver are settled by taking every one-sided change and keeping the
/// most recent head's value wherever both sides changed a key.
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicyFactory {
    policy: MergePolicy,
}

impl FixedPolicyFactory {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }
}

impl ConflictResolverFactory for FixedPolicyFactory {
    fn get_policy(&self, _page_id: &PageId) -> PolicyFuture {
        let policy = self.policy;
        Box::pin(async move { policy })
    }

    fn new_conflict_resolver(&self, _page_id: &PageId, mut request: ResolverRequest) {
        tokio::spawn(async move {
            while let Some(conflict) = request.recv().await {
                let provider = conflict.result_provider;
                let outcome = match provider.merge_non_conflicting_entries().await {
                    Ok(()) => provider.done().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    warn!(page = %request.page_id(), error = %e, "built-in resolver failed");
                }
            }
        });
    }
}
