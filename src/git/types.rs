use std::path::PathBuf;

use crate::subprocess::ProcessError;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unknown ref: {0}")]
    UnknownRef(String),

    #[error("worktree path exists and is not empty: {0}")]
    WorktreePathNotEmpty(PathBuf),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of an in-object-store three-way merge (`merge-tree`); nothing in
/// the working copy is touched either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeMergeOutcome {
    /// Merge is conflict-free; `tree` is the merged tree OID, ready for
    /// `commit_tree`.
    Clean { tree: String },
    /// The merge would conflict in these files.
    Conflicts { files: Vec<String> },
}

/// Result of an in-place merge in a checked-out working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Clean,
    /// Merge stopped with unmerged paths left in the index.
    Conflicts { files: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStats {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub sha: String,
    pub subject: String,
}

/// One path touched by a commit, with its one-letter status (A/M/D/R...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitChange {
    pub status: String,
    pub path: String,
}
