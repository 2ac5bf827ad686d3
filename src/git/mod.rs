//! Typed async wrappers over the git CLI.
//!
//! Pure resource layer: worktrees, branches, stash, refs, merges. No
//! scheduling knowledge lives here, no operation mutates process-wide
//! state, and every failure is converted to a [`GitError`] at this boundary
//! so the scheduler's pump never unwinds through a raw subprocess error.

pub mod parsers;
pub mod service;
pub mod types;

pub use service::GitService;
pub use types::{
    CommitChange, CommitEntry, DiffStats, GitError, MergeOutcome, TreeMergeOutcome,
};
