//! Conflict detection, merging and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- picking the two most recent heads and their merge base.
//! 2. **Merging** -- the last-one-wins and automatic merge algorithms.
//! 3. **Resolution** -- sessions negotiated with an external resolver, and
//!    the per-page coordinator that owns the policy and the sessions.

pub mod coordinator;
pub mod detector;
pub mod merger;
pub mod resolver;
pub mod session;

pub use coordinator::MergeCoordinator;
pub use detector::{Conflict, ConflictDetector};
pub use merger::Merger;
pub use resolver::{
    ConflictResolverFactory, FixedPolicyFactory, MergeResultProvider, PolicyFuture,
    ResolveRequest, ResolverRequest,
};
pub use session::{ResolutionSession, SessionKey, SessionState};
