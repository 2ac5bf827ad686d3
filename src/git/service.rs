//! The git resource service.
//!
//! Every operation shells out through the injected [`SubprocessManager`],
//! reports a typed result, and never blocks the scheduler. An optional log
//! sink receives one line per git invocation for attempt-log tracing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::parsers;
use super::types::{
    CommitChange, CommitEntry, DiffStats, GitError, MergeOutcome, TreeMergeOutcome,
};
use crate::subprocess::{ProcessCommandBuilder, ProcessOutput, SubprocessManager};

pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct GitService {
    subprocess: SubprocessManager,
    sink: Option<LogSink>,
}

impl GitService {
    pub fn new(subprocess: SubprocessManager) -> Self {
        Self {
            subprocess,
            sink: None,
        }
    }

    /// Same service, with every git invocation mirrored to `sink`.
    pub fn with_sink(&self, sink: LogSink) -> Self {
        Self {
            subprocess: self.subprocess.clone(),
            sink: Some(sink),
        }
    }

    fn trace(&self, cwd: &Path, args: &[&str]) {
        let line = format!("git {} (cwd: {})", args.join(" "), cwd.display());
        debug!("{line}");
        if let Some(sink) = &self.sink {
            sink(&line);
        }
    }

    /// Run git, returning the raw output regardless of exit status.
    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<ProcessOutput, GitError> {
        self.trace(cwd, args);
        let command = ProcessCommandBuilder::new("git")
            .current_dir(cwd)
            .args(args)
            .build();
        Ok(self.subprocess.runner().run(command).await?)
    }

    /// Run git, converting a non-zero exit into [`GitError::CommandFailed`].
    async fn git_ok(&self, cwd: &Path, args: &[&str]) -> Result<ProcessOutput, GitError> {
        let output = self.git(cwd, args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    // --- worktrees ---

    /// Create a worktree at `worktree_path` with a fresh branch attached at
    /// `from_ref` (detached HEAD when `branch` is None).
    pub async fn create_worktree(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch: Option<&str>,
        from_ref: &str,
    ) -> Result<(), GitError> {
        if worktree_path.exists()
            && std::fs::read_dir(worktree_path)?.next().is_some()
        {
            return Err(GitError::WorktreePathNotEmpty(worktree_path.to_path_buf()));
        }
        // Fail on unknown refs before git invents an empty branch for them.
        self.resolve_ref(repo, from_ref).await?;
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path = worktree_path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "add"];
        if let Some(name) = branch {
            args.extend(["-b", name]);
        } else {
            args.push("--detach");
        }
        args.push(&path);
        args.push(from_ref);
        self.git_ok(repo, &args).await?;
        Ok(())
    }

    /// Remove a worktree; returns true when removed or already gone.
    /// Never returns an error.
    pub async fn remove_worktree_safe(&self, repo: &Path, worktree_path: &Path, force: bool) -> bool {
        let path = worktree_path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path);

        match self.git(repo, &args).await {
            Ok(output) if output.status.success() => true,
            Ok(output) if output.stderr.contains("is not a working tree") => {
                // Directory may still exist without being a registered
                // worktree (e.g. interrupted creation).
                if worktree_path.exists() && force {
                    let _ = std::fs::remove_dir_all(worktree_path);
                }
                let _ = self.git(repo, &["worktree", "prune"]).await;
                !worktree_path.exists()
            }
            Ok(output) => {
                debug!(
                    "worktree remove failed for {}: {}",
                    worktree_path.display(),
                    output.stderr.trim()
                );
                if force && worktree_path.exists() {
                    let _ = std::fs::remove_dir_all(worktree_path);
                    let _ = self.git(repo, &["worktree", "prune"]).await;
                }
                !worktree_path.exists()
            }
            Err(_) => !worktree_path.exists(),
        }
    }

    pub async fn is_valid_worktree(&self, path: &Path) -> bool {
        if !path.join(".git").exists() {
            return false;
        }
        matches!(
            self.git(path, &["rev-parse", "--is-inside-work-tree"]).await,
            Ok(output) if output.status.success() && output.stdout.trim() == "true"
        )
    }

    /// Main repository directory owning `worktree` (the parent of its
    /// common git dir).
    pub async fn main_repo_of(&self, worktree: &Path) -> Result<PathBuf, GitError> {
        let output = self
            .git_ok(
                worktree,
                &["rev-parse", "--path-format=absolute", "--git-common-dir"],
            )
            .await?;
        let git_dir = PathBuf::from(output.stdout.trim());
        Ok(git_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(git_dir))
    }

    /// List registered worktree paths for the repository.
    pub async fn list_worktrees(&self, repo: &Path) -> Result<Vec<PathBuf>, GitError> {
        let output = self
            .git_ok(repo, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    // --- branches and refs ---

    /// Current branch name, or "HEAD" when detached.
    pub async fn current_branch(&self, path: &Path) -> Result<String, GitError> {
        let output = self
            .git_ok(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    pub async fn head(&self, path: &Path) -> Result<String, GitError> {
        self.resolve_ref(path, "HEAD").await
    }

    pub async fn create_branch(&self, repo: &Path, name: &str, from: &str) -> Result<(), GitError> {
        self.git_ok(repo, &["branch", name, from]).await?;
        Ok(())
    }

    pub async fn delete_local_branch(&self, repo: &Path, name: &str) -> Result<(), GitError> {
        self.git_ok(repo, &["branch", "-D", name]).await?;
        Ok(())
    }

    pub async fn delete_remote_branch(&self, repo: &Path, name: &str) -> Result<(), GitError> {
        self.git_ok(repo, &["push", "origin", "--delete", name]).await?;
        Ok(())
    }

    pub async fn branch_exists(&self, repo: &Path, name: &str) -> bool {
        let refname = format!("refs/heads/{name}");
        matches!(
            self.git(repo, &["rev-parse", "--verify", "--quiet", &refname]).await,
            Ok(output) if output.status.success()
        )
    }

    pub async fn checkout(&self, repo: &Path, reference: &str) -> Result<(), GitError> {
        self.git_ok(repo, &["checkout", reference]).await?;
        Ok(())
    }

    pub async fn reset_hard(&self, repo: &Path, reference: &str) -> Result<(), GitError> {
        self.git_ok(repo, &["reset", "--hard", reference]).await?;
        Ok(())
    }

    pub async fn resolve_ref(&self, repo: &Path, reference: &str) -> Result<String, GitError> {
        let spec = format!("{reference}^{{commit}}");
        let output = self
            .git(repo, &["rev-parse", "--verify", "--quiet", &spec])
            .await?;
        if output.status.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(GitError::UnknownRef(reference.to_string()))
        }
    }

    /// The branch `origin/HEAD` points at, with `main`/`master`/`trunk`
    /// fallbacks for repositories without a remote.
    pub async fn default_branch(&self, repo: &Path) -> Result<String, GitError> {
        if let Ok(output) = self
            .git_ok(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await
        {
            if let Some(name) = output.stdout.trim().strip_prefix("refs/remotes/origin/") {
                return Ok(name.to_string());
            }
        }
        for candidate in ["main", "master", "trunk"] {
            if self.branch_exists(repo, candidate).await {
                return Ok(candidate.to_string());
            }
        }
        Ok("main".to_string())
    }

    // --- working tree state ---

    pub async fn has_uncommitted_changes(&self, repo: &Path) -> Result<bool, GitError> {
        let output = self.git_ok(repo, &["status", "--porcelain"]).await?;
        Ok(!output.stdout.trim().is_empty())
    }

    pub async fn stage_all(&self, repo: &Path) -> Result<(), GitError> {
        self.git_ok(repo, &["add", "-A"]).await?;
        Ok(())
    }

    pub async fn has_staged_changes(&self, repo: &Path) -> Result<bool, GitError> {
        let output = self.git(repo, &["diff", "--cached", "--quiet"]).await?;
        Ok(!output.status.success())
    }

    pub async fn commit(&self, repo: &Path, message: &str) -> Result<(), GitError> {
        self.git_ok(repo, &["commit", "-m", message]).await?;
        Ok(())
    }

    pub async fn push(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.git_ok(repo, &["push", "origin", branch]).await?;
        Ok(())
    }

    /// Stash tracked and untracked changes; returns true when something was
    /// actually stashed.
    pub async fn stash_push(&self, repo: &Path, message: &str) -> Result<bool, GitError> {
        let output = self
            .git_ok(repo, &["stash", "push", "--include-untracked", "-m", message])
            .await?;
        Ok(parsers::stash_created(&output.stdout))
    }

    pub async fn stash_pop(&self, repo: &Path) -> Result<(), GitError> {
        self.git_ok(repo, &["stash", "pop"]).await?;
        Ok(())
    }

    // --- history queries ---

    pub async fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<String, GitError> {
        let output = self.git_ok(repo, &["merge-base", a, b]).await?;
        Ok(output.stdout.trim().to_string())
    }

    pub async fn commit_log(
        &self,
        repo: &Path,
        from: &str,
        to: &str,
    ) -> Result<Vec<CommitEntry>, GitError> {
        let range = format!("{from}..{to}");
        let output = self
            .git_ok(repo, &["log", "--format=%H%x09%s", &range])
            .await?;
        Ok(parsers::parse_commit_log(&output.stdout))
    }

    pub async fn commit_changes(
        &self,
        repo: &Path,
        sha: &str,
    ) -> Result<Vec<CommitChange>, GitError> {
        let output = self
            .git_ok(repo, &["show", "--name-status", "--format=", sha])
            .await?;
        Ok(parsers::parse_name_status(&output.stdout))
    }

    pub async fn diff_stats(
        &self,
        repo: &Path,
        from: &str,
        to: &str,
    ) -> Result<DiffStats, GitError> {
        let range = format!("{from}..{to}");
        let output = self.git_ok(repo, &["diff", "--shortstat", &range]).await?;
        Ok(parsers::parse_shortstat(&output.stdout))
    }

    // --- merging ---

    /// Three-way merge in the object store; the working copy and index are
    /// untouched regardless of outcome.
    pub async fn merge_without_checkout(
        &self,
        repo: &Path,
        source: &str,
        target: &str,
    ) -> Result<TreeMergeOutcome, GitError> {
        let output = self
            .git(
                repo,
                &["merge-tree", "--write-tree", "--name-only", target, source],
            )
            .await?;
        let (tree, files) = parsers::parse_merge_tree(&output.stdout);
        match output.status.code() {
            Some(0) => Ok(TreeMergeOutcome::Clean { tree }),
            Some(1) => Ok(TreeMergeOutcome::Conflicts { files }),
            _ => Err(GitError::CommandFailed {
                command: format!("merge-tree --write-tree {target} {source}"),
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    pub async fn commit_tree(
        &self,
        repo: &Path,
        tree: &str,
        parents: &[&str],
        message: &str,
    ) -> Result<String, GitError> {
        let mut args = vec!["commit-tree", tree];
        for parent in parents.iter().copied() {
            args.extend(["-p", parent]);
        }
        args.extend(["-m", message]);
        let output = self.git_ok(repo, &args).await?;
        Ok(output.stdout.trim().to_string())
    }

    /// In-place merge of `source` into the branch checked out at `cwd`.
    /// With `squash`, the squashed changes are committed with `message`
    /// when anything was staged.
    pub async fn merge(
        &self,
        cwd: &Path,
        source: &str,
        message: &str,
        squash: bool,
    ) -> Result<MergeOutcome, GitError> {
        let output = if squash {
            self.git(cwd, &["merge", "--squash", source]).await?
        } else {
            self.git(cwd, &["merge", "--no-ff", "-m", message, source])
                .await?
        };

        if !output.status.success() {
            let files = self.unmerged_files(cwd).await?;
            if !files.is_empty() {
                return Ok(MergeOutcome::Conflicts { files });
            }
            return Err(GitError::CommandFailed {
                command: format!("merge {source}"),
                stderr: output.stderr.trim().to_string(),
            });
        }

        if squash && self.has_staged_changes(cwd).await? {
            self.commit(cwd, message).await?;
        }
        Ok(MergeOutcome::Clean)
    }

    pub async fn abort_merge(&self, repo: &Path) -> Result<(), GitError> {
        self.git_ok(repo, &["merge", "--abort"]).await?;
        Ok(())
    }

    pub async fn unmerged_files(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let output = self
            .git_ok(repo, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Tracked files still containing conflict markers.
    pub async fn files_with_conflict_markers(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let output = self
            .git(repo, &["grep", "-l", "^<<<<<<< ", "--", "."])
            .await?;
        match output.status.code() {
            Some(0) => Ok(output
                .stdout
                .lines()
                .map(|line| line.trim().to_string())
                .collect()),
            Some(1) => Ok(Vec::new()),
            _ => Err(GitError::CommandFailed {
                command: "grep -l ^<<<<<<<".to_string(),
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }
}
