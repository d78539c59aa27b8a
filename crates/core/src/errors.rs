//! Error types for the ledger core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`LedgerError`] enum unifies them for callers that want a
//! single error type. [`LedgerError::status`] maps any error onto the
//! status codes returned across the page boundary.

use thiserror::Error;

use crate::models::Status;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Pagination(#[from] PaginationError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl LedgerError {
    /// The status code reported to external collaborators for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::Page(PageError::NotFound(_)) => Status::NotFound,
            Self::Commit(CommitError::NotFound(_)) => Status::NotFound,
            Self::Identity(_) => Status::AuthError,
            _ => Status::UnknownError,
        }
    }

    /// Shorthand for the error returned once a page has gone away.
    pub(crate) fn page_gone(page: impl std::fmt::Display) -> Self {
        Self::Page(PageError::NotFound(page.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Commit store errors
// ---------------------------------------------------------------------------

/// Structural errors raised while appending to or reading the commit graph.
#[derive(Debug, Error)]
pub enum CommitError {
    /// A parent referenced by the new commit is not in the store.
    #[error("parent commit {parent} of new commit is unknown")]
    InvalidParent { parent: String },

    /// The commit itself is malformed (bad entry order, empty key, ...).
    #[error("malformed commit: {0}")]
    Corrupt(String),

    /// A commit carried more parents than the graph allows.
    #[error("commit has {0} parents, at most 2 are allowed")]
    TooManyParents(usize),

    /// The requested commit does not exist.
    #[error("commit not found: {0}")]
    NotFound(String),

    /// Persisting the commit failed.
    #[error("commit storage error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Pagination errors
// ---------------------------------------------------------------------------

/// Errors from token-paginated listings (entries, keys, diffs).
#[derive(Debug, Error)]
pub enum PaginationError {
    /// The continuation token was not issued for this listing.
    #[error("continuation token does not belong to this listing")]
    InvalidToken,

    /// A page was produced with an inconsistent status/token pair.
    #[error("pagination invariant violated: {0}")]
    InvariantViolation(String),
}

// ---------------------------------------------------------------------------
// Resolution protocol errors
// ---------------------------------------------------------------------------

/// Errors raised when a resolver misuses the resolution protocol.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The session is finished, cancelled, or was never opened.
    #[error("resolution session {0} is closed")]
    SessionClosed(String),

    /// The session belongs to a resolver that has since been replaced.
    #[error("resolution session {session} belongs to stale resolver generation {generation}")]
    StaleGeneration { session: String, generation: u64 },

    /// A merge instruction was rejected.
    #[error("invalid merge instruction: {0}")]
    InvalidInstruction(String),

    /// The resolver channel closed before a request could be delivered.
    #[error("conflict resolver disconnected")]
    ResolverDisconnected,
}

// ---------------------------------------------------------------------------
// Page errors
// ---------------------------------------------------------------------------

/// Errors from page connections.
#[derive(Debug, Error)]
pub enum PageError {
    /// The page was deleted or its event loop has stopped.
    #[error("page not found: {0}")]
    NotFound(String),

    /// `commit` or `rollback` without an open transaction.
    #[error("no transaction in progress")]
    NoTransaction,

    /// `start_transaction` while one is already open.
    #[error("a transaction is already in progress")]
    TransactionInProgress,

    /// The key is not acceptable as a page key.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored row could not be decoded.
    #[error("corrupt {entity} record {id}: {detail}")]
    Corrupt {
        entity: String,
        id: String,
        detail: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Identity errors
// ---------------------------------------------------------------------------

/// Errors from ledger lookup by (user, app) identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("app id must not be empty")]
    EmptyAppId,
}
