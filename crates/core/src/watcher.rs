//! Change notifications for page observers.
//!
//! Each watcher sees, in commit order, the change from the last head it was
//! sent to every new single head of the page. A watcher has at most one
//! notification outstanding; the next one is sent when the previous one is
//! acknowledged. Changes larger than the configured page size are split
//! into several notifications.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::commit::Commit;
use crate::diff::DiffEngine;
use crate::models::{Entry, Key, PageChange, PageId, ResultState};
use crate::page::{PageCommand, PageSender};
use crate::pagination::PageLimits;
use crate::snapshot::PageSnapshot;

/// Receiving end of a page watcher. Dropping it unregisters the watcher.
pub struct PageWatcher {
    page_id: PageId,
    rx: mpsc::UnboundedReceiver<ChangeNotification>,
}

impl PageWatcher {
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// The next change, or `None` once the page is gone.
    pub async fn next_change(&mut self) -> Option<ChangeNotification> {
        self.rx.recv().await
    }

    /// A change already delivered, without waiting.
    pub fn try_next_change(&mut self) -> Option<ChangeNotification> {
        self.rx.try_recv().ok()
    }
}

/// One notification. Acknowledge it (or drop it) to receive the next.
#[derive(Debug)]
pub struct ChangeNotification {
    pub change: PageChange,
    pub result_state: ResultState,
    /// The page as of the head this change leads to.
    pub snapshot: PageSnapshot,
    ack: AckGuard,
}

impl ChangeNotification {
    pub fn ack(self) {
        drop(self.ack);
    }
}

#[derive(Debug)]
struct AckGuard {
    watcher: u64,
    page: PageSender,
}

impl Drop for AckGuard {
    fn drop(&mut self) {
        let _ = self.page.send(PageCommand::WatcherAck {
            watcher: self.watcher,
        });
    }
}

struct Part {
    change: PageChange,
    result_state: ResultState,
    snapshot: PageSnapshot,
}

struct WatcherState {
    tx: mpsc::UnboundedSender<ChangeNotification>,
    last: Arc<Commit>,
    queue: VecDeque<Part>,
    awaiting_ack: bool,
}

/// Per-page watcher registry, owned by the page loop.
pub(crate) struct WatcherNotifier {
    page_id: PageId,
    page: PageSender,
    change_page_size: usize,
    snapshot_limits: PageLimits,
    watchers: BTreeMap<u64, WatcherState>,
    next_id: u64,
}

impl WatcherNotifier {
    pub(crate) fn new(
        page_id: PageId,
        page: PageSender,
        change_page_size: usize,
        snapshot_limits: PageLimits,
    ) -> Self {
        Self {
            page_id,
            page,
            change_page_size: change_page_size.max(1),
            snapshot_limits,
            watchers: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.watchers.len()
    }

    /// Register a watcher whose first notification will be relative to
    /// `from`.
    pub(crate) fn register(&mut self, from: Arc<Commit>) -> PageWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_id += 1;
        debug!(page = %self.page_id, watcher = self.next_id, from = from.id().short(), "watcher registered");
        self.watchers.insert(
            self.next_id,
            WatcherState {
                tx,
                last: from,
                queue: VecDeque::new(),
                awaiting_ack: false,
            },
        );
        PageWatcher {
            page_id: self.page_id.clone(),
            rx,
        }
    }

    /// The page settled on `head`.
    pub(crate) fn on_new_head(&mut self, head: &Arc<Commit>, engine: &DiffEngine) {
        let snapshot = PageSnapshot::new(self.page_id.clone(), head.clone(), self.snapshot_limits);
        let ids: Vec<u64> = self.watchers.keys().copied().collect();
        for id in ids {
            let Some(watcher) = self.watchers.get_mut(&id) else {
                continue;
            };
            if watcher.last.id() == head.id() {
                continue;
            }
            let change = engine.page_change(&watcher.last, head);
            watcher.last = head.clone();
            if change.is_empty() {
                continue;
            }
            for (change, result_state) in split(change, self.change_page_size) {
                watcher.queue.push_back(Part {
                    change,
                    result_state,
                    snapshot: snapshot.clone(),
                });
            }
            self.pump(id);
        }
    }

    pub(crate) fn on_ack(&mut self, id: u64) {
        if let Some(watcher) = self.watchers.get_mut(&id) {
            watcher.awaiting_ack = false;
            self.pump(id);
        }
    }

    fn pump(&mut self, id: u64) {
        let Some(watcher) = self.watchers.get_mut(&id) else {
            return;
        };
        if watcher.awaiting_ack {
            return;
        }
        let Some(part) = watcher.queue.pop_front() else {
            return;
        };
        let notification = ChangeNotification {
            change: part.change,
            result_state: part.result_state,
            snapshot: part.snapshot,
            ack: AckGuard {
                watcher: id,
                page: self.page.clone(),
            },
        };
        match watcher.tx.send(notification) {
            Ok(()) => watcher.awaiting_ack = true,
            Err(_) => {
                // The ack of the undelivered notification is ignored.
                self.watchers.remove(&id);
                warn!(page = %self.page_id, watcher = id, "watcher disconnected");
            }
        }
    }
}

/// Split a change into parts of at most `size` changed plus deleted entries.
fn split(change: PageChange, size: usize) -> Vec<(PageChange, ResultState)> {
    if change.len() <= size {
        return vec![(change, ResultState::Completed)];
    }

    enum Item {
        Changed(Entry),
        Deleted(Key),
    }
    let timestamp = change.timestamp;
    let items: Vec<Item> = change
        .changed_entries
        .into_iter()
        .map(Item::Changed)
        .chain(change.deleted_keys.into_iter().map(Item::Deleted))
        .collect();

    let mut parts = Vec::new();
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        let mut part = PageChange {
            timestamp,
            changed_entries: Vec::new(),
            deleted_keys: Vec::new(),
        };
        for item in items.by_ref().take(size) {
            match item {
                Item::Changed(entry) => part.changed_entries.push(entry),
                Item::Deleted(key) => part.deleted_keys.push(key),
            }
        }
        parts.push(part);
    }

    let last = parts.len() - 1;
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| {
            let state = match i {
                0 => ResultState::PartialStarted,
                i if i == last => ResultState::PartialCompleted,
                _ => ResultState::PartialContinued,
            };
            (part, state)
        })
        .collect()
}
