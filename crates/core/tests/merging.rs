//! End-to-end tests of divergent heads and their resolution through the
//! public ledger API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use ledger_core::config::{LedgerConfig, PageSettings};
use ledger_core::conflict::{
    ConflictResolverFactory, FixedPolicyFactory, PolicyFuture, ResolveRequest, ResolverRequest,
};
use ledger_core::errors::{CommitError, LedgerError, ResolutionError};
use ledger_core::models::{
    ConflictResolutionWaitStatus, DiffEntry, EntryChange, MergePolicy, MergedValue, PageId,
    Paginated, ResultState, Status, Token,
};
use ledger_core::pagination::PageLimits;
use ledger_core::{Ledger, Page};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A factory that hands every resolver connection to the test.
struct TestFactory {
    policy: MergePolicy,
    delay: Option<Duration>,
    policy_calls: AtomicUsize,
    resolvers: mpsc::UnboundedSender<ResolverRequest>,
}

impl TestFactory {
    fn new(policy: MergePolicy) -> (Arc<Self>, mpsc::UnboundedReceiver<ResolverRequest>) {
        Self::delayed(policy, None)
    }

    fn delayed(
        policy: MergePolicy,
        delay: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ResolverRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Self {
            policy,
            delay,
            policy_calls: AtomicUsize::new(0),
            resolvers: tx,
        });
        (factory, rx)
    }

    fn policy_calls(&self) -> usize {
        self.policy_calls.load(Ordering::SeqCst)
    }
}

impl ConflictResolverFactory for TestFactory {
    fn get_policy(&self, _page_id: &PageId) -> PolicyFuture {
        self.policy_calls.fetch_add(1, Ordering::SeqCst);
        let (policy, delay) = (self.policy, self.delay);
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            policy
        })
    }

    fn new_conflict_resolver(&self, _page_id: &PageId, request: ResolverRequest) {
        let _ = self.resolvers.send(request);
    }
}

type Op<'a> = (&'a str, Option<&'a str>);

async fn apply(page: &Page, ops: &[Op<'_>]) {
    for (key, value) in ops {
        match value {
            Some(value) => page.put(key.as_bytes().to_vec(), value.as_bytes().to_vec()).await,
            None => page.delete(key.as_bytes().to_vec()).await,
        }
        .unwrap();
    }
}

/// Commit `right_ops` and then `left_ops` from concurrent transactions on
/// the same base, leaving two heads (the later one is "left").
async fn diverge(right: &Page, right_ops: &[Op<'_>], left: &Page, left_ops: &[Op<'_>]) {
    right.start_transaction().await.unwrap();
    left.start_transaction().await.unwrap();
    apply(right, right_ops).await;
    apply(left, left_ops).await;
    right.commit().await.unwrap();
    left.commit().await.unwrap();
}

async fn value(page: &Page, key: &str) -> Option<String> {
    let snapshot = page.get_snapshot().await.unwrap();
    snapshot
        .get(key.as_bytes())
        .map(|v| String::from_utf8(v.clone()).unwrap())
}

async fn next_conflict(
    resolvers: &mut mpsc::UnboundedReceiver<ResolverRequest>,
) -> (ResolverRequest, ResolveRequest) {
    let mut resolver = resolvers.recv().await.expect("resolver requested");
    let request = resolver.recv().await.expect("conflict delivered");
    (resolver, request)
}

async fn collect_diff<F, Fut>(mut fetch: F) -> (Vec<DiffEntry>, usize)
where
    F: FnMut(Option<Token>) -> Fut,
    Fut: std::future::Future<Output = Result<Paginated<DiffEntry>, LedgerError>>,
{
    let mut entries = Vec::new();
    let mut pages = 0;
    let mut token = None;
    loop {
        let page = fetch(token.take()).await.unwrap();
        pages += 1;
        let (status, items, next) = page.into_parts();
        match &next {
            Some(_) => assert_eq!(status, Status::PartialResult),
            None => assert_eq!(status, Status::Ok),
        }
        entries.extend(items);
        match next {
            Some(next) => token = Some(next),
            None => return (entries, pages),
        }
    }
}

fn page_id(name: &str) -> PageId {
    PageId::new(name.as_bytes().to_vec())
}

// ---------------------------------------------------------------------------
// Custom resolver
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_custom_resolver_multipart_merge() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let (factory, mut resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(factory.clone()));

    let alice = ledger.get_page(page_id("contacts")).await.unwrap();
    let bob = ledger.get_page(page_id("contacts")).await.unwrap();
    apply(&alice, &[("name", Some("Alice")), ("email", Some("alice@example.com"))]).await;

    diverge(
        &alice,
        &[("name", Some("Alice Smith")), ("phone", Some("555-0100"))],
        &bob,
        &[("name", Some("Alice Jones")), ("email", None)],
    )
    .await;
    assert_eq!(alice.heads().await.unwrap().len(), 2);

    let (_resolver, request) = next_conflict(&mut resolvers).await;
    assert_eq!(request.left.get(b"name"), Some(&b"Alice Jones".to_vec()));
    assert_eq!(request.right.get(b"name"), Some(&b"Alice Smith".to_vec()));
    assert_eq!(request.common.get(b"name"), Some(&b"Alice".to_vec()));
    assert_eq!(factory.policy_calls(), 1);

    let provider = request.result_provider;
    let conflicting = provider.get_conflicting_diff(None).await.unwrap();
    let keys: Vec<&[u8]> = conflicting.items().iter().map(|e| e.key.as_slice()).collect();
    assert_eq!(keys, vec![b"name".as_slice()]);

    let full = provider.get_full_diff(None).await.unwrap();
    let keys: Vec<&[u8]> = full.items().iter().map(|e| e.key.as_slice()).collect();
    assert_eq!(keys, vec![b"email".as_slice(), b"name".as_slice(), b"phone".as_slice()]);

    // A bad batch is rejected as a whole and the session stays usable.
    let err = provider
        .merge(vec![MergedValue::right(b"phone".to_vec()), MergedValue::delete(Vec::new())])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Resolution(ResolutionError::InvalidInstruction(_))
    ));

    provider
        .merge(vec![MergedValue::new_value(b"name".to_vec(), b"Alice Smith-Jones".to_vec())])
        .await
        .unwrap();
    provider
        .merge(vec![MergedValue::right(b"phone".to_vec())])
        .await
        .unwrap();
    provider.done().await.unwrap();

    assert_eq!(alice.heads().await.unwrap().len(), 1);
    assert_eq!(value(&alice, "name").await.as_deref(), Some("Alice Smith-Jones"));
    assert_eq!(value(&bob, "phone").await.as_deref(), Some("555-0100"));
    assert_eq!(value(&bob, "email").await, None);

    let err = provider.get_full_diff(None).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Resolution(ResolutionError::SessionClosed(_))
    ));

    let head = alice.heads().await.unwrap().remove(0);
    let merge = alice.get_commit(&head).await.unwrap();
    assert_eq!(merge.parents().len(), 2);
}

#[tokio::test]
async fn test_diff_pages_cover_every_key() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let (factory, mut resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(factory));

    let left = ledger.get_page(page_id("bulk")).await.unwrap();
    let right = ledger.get_page(page_id("bulk")).await.unwrap();
    let left_keys: Vec<String> = (0..50).map(|i| format!("left-{i:02}")).collect();
    let right_keys: Vec<String> = (0..50).map(|i| format!("right-{i:02}")).collect();
    let left_ops: Vec<Op> = left_keys.iter().map(|k| (k.as_str(), Some("l"))).collect();
    let right_ops: Vec<Op> = right_keys.iter().map(|k| (k.as_str(), Some("r"))).collect();
    diverge(&right, &right_ops, &left, &left_ops).await;

    let (_resolver, request) = next_conflict(&mut resolvers).await;
    let provider = request.result_provider;

    let p = &provider;
    let (entries, pages) =
        collect_diff(|token| async move { p.get_full_diff(token.as_ref()).await }).await;
    assert_eq!(entries.len(), 100);
    assert!(pages > 1);
    assert!(entries.windows(2).all(|w| w[0].key < w[1].key));

    let (conflicting, pages) =
        collect_diff(|token| async move { p.get_conflicting_diff(token.as_ref()).await }).await;
    assert!(conflicting.is_empty());
    assert_eq!(pages, 1);

    provider.merge_non_conflicting_entries().await.unwrap();
    provider.done().await.unwrap();
    let snapshot = left.get_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 100);
}

// ---------------------------------------------------------------------------
// Automatic and last-one-wins policies
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_automatic_merges_disjoint_changes() {
    let ledger = Ledger::in_memory(PageSettings::default());
    // The policy arrives after the waiter is registered.
    let (factory, mut resolvers) =
        TestFactory::delayed(MergePolicy::AutomaticWithFallback, Some(Duration::from_secs(1)));
    ledger.set_conflict_resolver_factory(Some(factory));

    let a = ledger.get_page(page_id("auto")).await.unwrap();
    let b = ledger.get_page(page_id("auto")).await.unwrap();
    diverge(&a, &[("phone", Some("555"))], &b, &[("name", Some("Alice"))]).await;

    let outcome = a.wait_for_conflict_resolution().await.unwrap();
    assert_eq!(outcome, ConflictResolutionWaitStatus::ConflictsResolved);
    assert_eq!(a.heads().await.unwrap().len(), 1);
    assert_eq!(value(&a, "phone").await.as_deref(), Some("555"));
    assert_eq!(value(&a, "name").await.as_deref(), Some("Alice"));

    // A resolver is bound even though nothing was delegated to it.
    let mut resolver = resolvers.recv().await.unwrap();
    assert!(resolver.try_recv().is_none());
}

#[tokio::test]
async fn test_automatic_delegates_real_conflicts() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let (factory, mut resolvers) = TestFactory::new(MergePolicy::AutomaticWithFallback);
    ledger.set_conflict_resolver_factory(Some(factory));

    let a = ledger.get_page(page_id("auto")).await.unwrap();
    let b = ledger.get_page(page_id("auto")).await.unwrap();
    diverge(
        &a,
        &[("name", Some("Bob")), ("phone", Some("555"))],
        &b,
        &[("name", Some("Alice")), ("city", Some("Paris"))],
    )
    .await;

    let (_resolver, request) = next_conflict(&mut resolvers).await;
    let provider = request.result_provider;
    let conflicting = provider.get_conflicting_diff(None).await.unwrap();
    assert_eq!(conflicting.items().len(), 1);
    assert_eq!(conflicting.items()[0].key, b"name".to_vec());

    provider
        .merge(vec![MergedValue::right(b"name".to_vec())])
        .await
        .unwrap();
    provider.done().await.unwrap();

    assert_eq!(value(&a, "name").await.as_deref(), Some("Bob"));
    assert_eq!(value(&a, "phone").await.as_deref(), Some("555"));
    assert_eq!(value(&a, "city").await.as_deref(), Some("Paris"));
}

#[tokio::test]
async fn test_last_one_wins_without_factory() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let a = ledger.get_page(page_id("lww")).await.unwrap();
    let b = ledger.get_page(page_id("lww")).await.unwrap();
    apply(&a, &[("name", Some("Alice"))]).await;

    diverge(
        &a,
        &[("name", Some("Older")), ("phone", Some("555"))],
        &b,
        &[("name", Some("Newer"))],
    )
    .await;

    assert_eq!(a.heads().await.unwrap().len(), 1);
    assert_eq!(value(&a, "name").await.as_deref(), Some("Newer"));
    assert_eq!(value(&b, "phone").await.as_deref(), Some("555"));
    assert_eq!(
        a.wait_for_conflict_resolution().await.unwrap(),
        ConflictResolutionWaitStatus::NoConflicts
    );
}

#[tokio::test]
async fn test_three_heads_collapse_pairwise() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let page = ledger.get_page(page_id("three")).await.unwrap();
    page.put(b"seed".to_vec(), b"0".to_vec()).await.unwrap();
    let base = page.heads().await.unwrap().remove(0);

    // Hold the page so all three heads exist before merging starts.
    let (factory, _resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(factory));
    for name in ["a", "b", "c"] {
        let change = EntryChange::put(name.as_bytes().to_vec(), b"1".to_vec());
        page.add_remote_commit(&base, vec![change], chrono::Utc::now())
            .await
            .unwrap();
    }
    assert_eq!(page.heads().await.unwrap().len(), 3);

    ledger.set_conflict_resolver_factory(Some(Arc::new(FixedPolicyFactory::new(
        MergePolicy::LastOneWins,
    ))));
    let outcome = page.wait_for_conflict_resolution().await.unwrap();
    assert_eq!(outcome, ConflictResolutionWaitStatus::ConflictsResolved);

    assert_eq!(page.heads().await.unwrap().len(), 1);
    let merges = page
        .log()
        .await
        .unwrap()
        .iter()
        .filter(|c| c.is_merge())
        .count();
    assert_eq!(merges, 2);
    for key in ["a", "b", "c", "seed"] {
        assert!(value(&page, key).await.is_some(), "missing {key}");
    }
}

// ---------------------------------------------------------------------------
// Resolver lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_resolver_disconnect_refetches_policy() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let (factory, mut resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(factory.clone()));

    let a = ledger.get_page(page_id("flaky")).await.unwrap();
    let b = ledger.get_page(page_id("flaky")).await.unwrap();
    diverge(&a, &[("k", Some("right"))], &b, &[("k", Some("left"))]).await;

    let (resolver, request) = next_conflict(&mut resolvers).await;
    let stale = request.result_provider;
    drop(resolver);

    let (_resolver, request) = next_conflict(&mut resolvers).await;
    assert_eq!(factory.policy_calls(), 2);

    // The first session was cancelled with its resolver.
    assert!(stale.done().await.is_err());
    drop(stale);

    let provider = request.result_provider;
    provider
        .merge(vec![MergedValue::right(b"k".to_vec())])
        .await
        .unwrap();
    provider.done().await.unwrap();
    assert_eq!(value(&a, "k").await.as_deref(), Some("right"));
}

#[tokio::test]
async fn test_abandoned_session_is_reissued() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let (factory, mut resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(factory.clone()));

    let a = ledger.get_page(page_id("abandon")).await.unwrap();
    let b = ledger.get_page(page_id("abandon")).await.unwrap();
    diverge(&a, &[("k", Some("right"))], &b, &[("k", Some("left"))]).await;

    let (mut resolver, first) = next_conflict(&mut resolvers).await;
    let first_session = first.result_provider.session();
    drop(first);

    let second = resolver.recv().await.unwrap();
    assert_ne!(second.result_provider.session(), first_session);
    assert_eq!(factory.policy_calls(), 1);
    second.result_provider.done().await.unwrap();
    assert_eq!(value(&a, "k").await.as_deref(), Some("left"));
}

#[tokio::test(start_paused = true)]
async fn test_factory_replaced_while_policy_pending() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let (slow, mut slow_resolvers) =
        TestFactory::delayed(MergePolicy::Custom, Some(Duration::from_secs(10)));
    ledger.set_conflict_resolver_factory(Some(slow.clone()));

    let a = ledger.get_page(page_id("race")).await.unwrap();
    let b = ledger.get_page(page_id("race")).await.unwrap();
    diverge(&a, &[("k", Some("right"))], &b, &[("k", Some("left"))]).await;
    assert_eq!(slow.policy_calls(), 1);

    let (fast, mut fast_resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(fast.clone()));

    let (_resolver, request) = next_conflict(&mut fast_resolvers).await;
    assert_eq!(request.result_provider.session().generation, 2);

    // Let the first factory's answer arrive; it belongs to a replaced
    // installation and is dropped.
    tokio::time::sleep(Duration::from_secs(20)).await;
    let status = a.status().await.unwrap();
    assert_eq!(status.resolver_generation, 2);
    assert_eq!(status.active_sessions, 1);
    assert!(slow_resolvers.try_recv().is_err());

    request.result_provider.done().await.unwrap();
    assert_eq!(a.heads().await.unwrap().len(), 1);
    assert_eq!(fast.policy_calls(), 1);
}

#[tokio::test]
async fn test_factory_replaced_with_open_session() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let (old, mut old_resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(old));

    let a = ledger.get_page(page_id("handover")).await.unwrap();
    let b = ledger.get_page(page_id("handover")).await.unwrap();
    diverge(&a, &[("k", Some("right"))], &b, &[("k", Some("left"))]).await;
    let (mut old_resolver, old_request) = next_conflict(&mut old_resolvers).await;

    let waiter = tokio::spawn(async move { b.wait_for_conflict_resolution().await });
    tokio::task::yield_now().await;
    a.status().await.unwrap();

    let (new, mut new_resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(new.clone()));
    let (_new_resolver, new_request) = next_conflict(&mut new_resolvers).await;

    // The old binding is closed and its session can no longer commit.
    assert!(old_resolver.recv().await.is_none());
    let err = old_request.result_provider.done().await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Resolution(ResolutionError::StaleGeneration { .. })
    ));

    let status = a.status().await.unwrap();
    assert_eq!(status.active_sessions, 1);
    assert_eq!(status.heads.len(), 2);
    assert!(new_resolvers.try_recv().is_err());
    assert_eq!(new.policy_calls(), 1);

    new_request
        .result_provider
        .merge(vec![MergedValue::right(b"k".to_vec())])
        .await
        .unwrap();
    new_request.result_provider.done().await.unwrap();
    assert_eq!(
        waiter.await.unwrap().unwrap(),
        ConflictResolutionWaitStatus::ConflictsResolved
    );
    assert_eq!(value(&a, "k").await.as_deref(), Some("right"));
}

#[tokio::test]
async fn test_removing_factory_falls_back_to_last_one_wins() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let (factory, mut resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(factory));

    let a = ledger.get_page(page_id("fallback")).await.unwrap();
    let b = ledger.get_page(page_id("fallback")).await.unwrap();
    diverge(&a, &[("k", Some("right"))], &b, &[("k", Some("left"))]).await;
    let (_resolver, request) = next_conflict(&mut resolvers).await;

    ledger.set_conflict_resolver_factory(None);
    assert_eq!(a.heads().await.unwrap().len(), 1);
    assert_eq!(value(&a, "k").await.as_deref(), Some("left"));

    let err = request.result_provider.done().await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Resolution(ResolutionError::StaleGeneration { .. })
    ));
}

#[tokio::test]
async fn test_delete_page_during_resolution() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let (factory, mut resolvers) = TestFactory::new(MergePolicy::Custom);
    ledger.set_conflict_resolver_factory(Some(factory));

    let id = page_id("doomed");
    let a = ledger.get_page(id.clone()).await.unwrap();
    let b = ledger.get_page(id.clone()).await.unwrap();
    diverge(&a, &[("k", Some("right"))], &b, &[("k", Some("left"))]).await;
    let (_resolver, request) = next_conflict(&mut resolvers).await;

    let waiter = tokio::spawn(async move { b.wait_for_conflict_resolution().await });
    tokio::task::yield_now().await;
    a.status().await.unwrap();

    ledger.delete_page(&id).await.unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.status(), Status::NotFound);
    let err = request.result_provider.done().await.unwrap_err();
    assert_eq!(err.status(), Status::NotFound);
    let err = a.heads().await.unwrap_err();
    assert_eq!(err.status(), Status::NotFound);
    assert!(ledger.list_pages().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Watchers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_watcher_receives_paginated_changes_with_backpressure() {
    let settings = PageSettings {
        change_page_size: 2,
        ..PageSettings::default()
    };
    let ledger = Ledger::in_memory(settings);
    let observer = ledger.get_page(page_id("watched")).await.unwrap();
    let writer = ledger.get_page(page_id("watched")).await.unwrap();
    let (snapshot, mut watcher) = observer.watch().await.unwrap();
    assert!(snapshot.is_empty());

    writer.start_transaction().await.unwrap();
    apply(
        &writer,
        &[("a", Some("1")), ("b", Some("2")), ("c", Some("3")), ("d", Some("4")), ("e", Some("5"))],
    )
    .await;
    writer.commit().await.unwrap();

    let mut states = Vec::new();
    let mut keys = Vec::new();
    while states.last() != Some(&ResultState::PartialCompleted) {
        let notification = watcher.next_change().await.unwrap();
        // Nothing more arrives until this part is acknowledged.
        assert!(watcher.try_next_change().is_none());
        states.push(notification.result_state);
        keys.extend(notification.change.changed_entries.iter().map(|e| e.key.clone()));
        assert_eq!(notification.snapshot.len(), 5);
        notification.ack();
    }
    assert_eq!(
        states,
        vec![
            ResultState::PartialStarted,
            ResultState::PartialContinued,
            ResultState::PartialCompleted,
        ]
    );
    assert_eq!(keys.len(), 5);

    writer.delete(b"a".to_vec()).await.unwrap();
    let notification = watcher.next_change().await.unwrap();
    assert_eq!(notification.result_state, ResultState::Completed);
    assert_eq!(notification.change.deleted_keys, vec![b"a".to_vec()]);
}

#[tokio::test]
async fn test_watcher_sees_merge_result() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let a = ledger.get_page(page_id("merged")).await.unwrap();
    let b = ledger.get_page(page_id("merged")).await.unwrap();
    let observer = ledger.get_page(page_id("merged")).await.unwrap();
    let (_, mut watcher) = observer.watch().await.unwrap();

    diverge(&a, &[("x", Some("1"))], &b, &[("y", Some("2"))]).await;

    // Watchers only see single heads: the first commit, then the merge.
    let first = watcher.next_change().await.unwrap();
    assert_eq!(first.change.changed_entries.len(), 1);
    first.ack();
    let merged = watcher.next_change().await.unwrap();
    assert_eq!(merged.snapshot.len(), 2);
    assert_eq!(merged.change.changed_entries[0].key, b"y".to_vec());
}

#[tokio::test]
async fn test_replayed_commit_does_not_renotify() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let observer = ledger.get_page(page_id("replay")).await.unwrap();
    let writer = ledger.get_page(page_id("replay")).await.unwrap();
    let (_, mut watcher) = observer.watch().await.unwrap();

    let root = writer.heads().await.unwrap().remove(0);
    let changes = vec![EntryChange::put(b"remote".to_vec(), b"1".to_vec())];
    let at = chrono::Utc::now();
    let remote = writer
        .add_remote_commit(&root, changes.clone(), at)
        .await
        .unwrap();
    watcher.next_change().await.unwrap().ack();

    writer.put(b"local".to_vec(), b"2".to_vec()).await.unwrap();
    let local = watcher.next_change().await.unwrap();
    assert_eq!(local.change.changed_entries[0].key, b"local".to_vec());
    local.ack();

    // Same content, same id: already an ancestor of the head, so the head
    // set does not move and nobody is told about it again.
    let replayed = writer.add_remote_commit(&root, changes, at).await.unwrap();
    assert_eq!(replayed, remote);
    assert_eq!(writer.heads().await.unwrap().len(), 1);
    assert!(watcher.try_next_change().is_none());
    assert_eq!(value(&observer, "local").await.as_deref(), Some("2"));
}

// ---------------------------------------------------------------------------
// Persistence and remote commits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sqlite_ledger_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LedgerConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    let id = page_id("durable");

    let head = {
        let ledger = Ledger::open(&config).unwrap();
        let page = ledger.get_page(id.clone()).await.unwrap();
        page.put(b"name".to_vec(), b"Alice".to_vec()).await.unwrap();
        page.put(b"phone".to_vec(), b"555".to_vec()).await.unwrap();
        page.delete(b"phone".to_vec()).await.unwrap();
        page.heads().await.unwrap()
    };

    let ledger = Ledger::open(&config).unwrap();
    assert_eq!(ledger.list_pages().unwrap(), vec![id.clone()]);
    let page = ledger.get_page(id).await.unwrap();
    assert_eq!(page.heads().await.unwrap(), head);
    assert_eq!(value(&page, "name").await.as_deref(), Some("Alice"));
    assert_eq!(value(&page, "phone").await, None);
    assert_eq!(page.log().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_remote_commit_on_unknown_parent_fails() {
    let ledger = Ledger::in_memory(PageSettings::default());
    let page = ledger.get_page(page_id("remote")).await.unwrap();
    page.put(b"k".to_vec(), b"v".to_vec()).await.unwrap();
    let head = page.heads().await.unwrap().remove(0);

    let other = Ledger::in_memory(PageSettings::default());
    let elsewhere = other.get_page(page_id("elsewhere")).await.unwrap();
    elsewhere.put(b"z".to_vec(), b"z".to_vec()).await.unwrap();
    let foreign = elsewhere.heads().await.unwrap().remove(0);

    let err = page
        .add_remote_commit(
            &foreign,
            vec![EntryChange::put(b"a".to_vec(), b"1".to_vec())],
            chrono::Utc::now(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Commit(CommitError::InvalidParent { .. })));
    assert_eq!(err.status(), Status::UnknownError);

    let id = page
        .add_remote_commit(
            &head,
            vec![EntryChange::put(b"a".to_vec(), b"1".to_vec())],
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(page.heads().await.unwrap(), vec![id]);
    assert_eq!(value(&page, "a").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_entries_pagination_by_bytes() {
    let settings = PageSettings {
        entries: PageLimits::new(100, 1024),
        ..PageSettings::default()
    };
    let ledger = Ledger::in_memory(settings);
    let page = ledger.get_page(page_id("big")).await.unwrap();
    page.start_transaction().await.unwrap();
    for i in 0..10 {
        page.put(format!("key-{i}").into_bytes(), vec![b'x'; 300]).await.unwrap();
    }
    page.commit().await.unwrap();
    let head = page.heads().await.unwrap().remove(0);

    let mut seen = 0;
    let mut token: Option<Token> = None;
    loop {
        let result = page.get_entries(&head, token.as_ref()).await.unwrap();
        assert!(!result.items().is_empty());
        seen += result.items().len();
        match result.next_token() {
            Some(next) => token = Some(next.clone()),
            None => break,
        }
    }
    assert_eq!(seen, 10);
}
