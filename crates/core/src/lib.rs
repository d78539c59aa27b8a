//! Ledger core library.
//!
//! A ledger stores pages: versioned key/value maps whose history is an
//! append-only commit graph. Concurrent writers (local connections, remote
//! replicas) can leave a page with several heads; the merge coordinator then
//! collapses them again, either automatically or by negotiating with an
//! external conflict resolver, and watchers are told about every new head.

pub mod commit;
pub mod config;
pub mod conflict;
pub mod db;
pub mod diff;
pub mod errors;
pub mod ledger;
pub mod models;
pub mod page;
pub mod pagination;
pub mod snapshot;
pub mod storage;
pub mod watcher;

// Re-exports for convenience.
pub use commit::{Commit, CommitStore};
pub use config::{LedgerConfig, PageSettings};
pub use conflict::{
    ConflictResolverFactory, FixedPolicyFactory, MergeResultProvider, ResolveRequest,
    ResolverRequest,
};
pub use db::Database;
pub use errors::LedgerError;
pub use ledger::{Ledger, LedgerRepository};
pub use page::{Page, PageStatus};
pub use snapshot::PageSnapshot;
pub use watcher::{ChangeNotification, PageWatcher};
