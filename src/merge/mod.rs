//! Merging completed work into target branches.
//!
//! All merges into the same `(repo, target branch)` are totally ordered by
//! an async gate; the user's checked-out branch and uncommitted changes are
//! captured before a merge touches HEAD and restored before it returns.

pub mod coordinator;
pub mod locks;

pub use coordinator::{MergeCoordinator, MergeError, MergeFailure, MergeRequest, MergedCommit};
pub use locks::{MergeLockGuard, MergeLocks};
