//! Serialized, user-state-preserving merges into a target branch.
//!
//! The fast path computes the merge in the object store (`merge-tree` +
//! `commit-tree`) and only touches the working copy to move the target ref.
//! The slow path checks the target out and merges in place, delegating
//! conflict resolution to the agent. Every exit restores the user's
//! original branch and stashed changes; when a pathological error prevents
//! that, the failure carries `user_state_restored = false`.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::locks::MergeLocks;
use crate::agent::{AgentDelegator, AgentRequest};
use crate::config::MergeConfig;
use crate::git::{GitError, GitService, MergeOutcome, TreeMergeOutcome};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("conflicts in {files:?} were not resolved")]
    UnresolvedConflicts { files: Vec<String> },

    #[error("agent could not resolve conflicts: {0}")]
    AgentFailed(String),

    #[error(transparent)]
    Git(#[from] GitError),
}

/// A failed merge, with whether the user's branch and working tree were put
/// back the way they were found.
#[derive(Debug)]
pub struct MergeFailure {
    pub error: MergeError,
    pub user_state_restored: bool,
}

impl std::fmt::Display for MergeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.user_state_restored {
            write!(f, " (user state NOT fully restored)")?;
        }
        Ok(())
    }
}

impl std::error::Error for MergeFailure {}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub repo: PathBuf,
    /// Commit to fold in.
    pub source_commit: String,
    pub target_branch: String,
    /// Name of the work unit, used in generated commit messages.
    pub work_unit: String,
    /// Overrides the generated commit message when set.
    pub message: Option<String>,
}

impl MergeRequest {
    fn commit_message(&self) -> String {
        self.message.clone().unwrap_or_else(|| {
            format!(
                "Merge {} into {}",
                self.work_unit, self.target_branch
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedCommit {
    pub commit: String,
    /// Whether the fast (no-checkout) path produced it.
    pub fast_path: bool,
}

struct UserState {
    /// Branch name, or the detached HEAD commit.
    original_ref: String,
    dirty: bool,
    on_target: bool,
    stashed: bool,
}

pub struct MergeCoordinator {
    git: GitService,
    agent: Arc<dyn AgentDelegator>,
    locks: MergeLocks,
    config: MergeConfig,
}

impl MergeCoordinator {
    pub fn new(
        git: GitService,
        agent: Arc<dyn AgentDelegator>,
        config: MergeConfig,
    ) -> Self {
        Self {
            git,
            agent,
            locks: MergeLocks::new(),
            config,
        }
    }

    /// Fold `source_commit` into `target_branch`, serialized per
    /// `(repo, target)`, leaving the user's checkout as it was found.
    pub async fn merge_to_target(
        &self,
        request: &MergeRequest,
    ) -> Result<MergedCommit, MergeFailure> {
        let _guard = self
            .locks
            .acquire(&request.repo, &request.target_branch)
            .await;

        let mut user = match self.capture_user_state(request).await {
            Ok(user) => user,
            Err(error) => {
                // Nothing was touched yet.
                return Err(MergeFailure {
                    error: error.into(),
                    user_state_restored: true,
                });
            }
        };

        let result = self.merge_locked(request, &mut user).await;
        match result {
            Ok(merged) => {
                self.push_if_configured(request).await;
                Ok(merged)
            }
            Err(error) => {
                let restored = self.restore_user_state(request, &user).await;
                Err(MergeFailure {
                    error,
                    user_state_restored: restored,
                })
            }
        }
    }

    async fn capture_user_state(&self, request: &MergeRequest) -> Result<UserState, GitError> {
        let branch = self.git.current_branch(&request.repo).await?;
        let original_ref = if branch == "HEAD" {
            self.git.head(&request.repo).await?
        } else {
            branch.clone()
        };
        let dirty = self.git.has_uncommitted_changes(&request.repo).await?;
        Ok(UserState {
            on_target: branch == request.target_branch,
            original_ref,
            dirty,
            stashed: false,
        })
    }

    async fn merge_locked(
        &self,
        request: &MergeRequest,
        user: &mut UserState,
    ) -> Result<MergedCommit, MergeError> {
        match self
            .git
            .merge_without_checkout(&request.repo, &request.source_commit, &request.target_branch)
            .await
        {
            Ok(TreeMergeOutcome::Clean { tree }) => {
                debug!(
                    "fast-path merge of {} into {} is conflict-free",
                    request.source_commit, request.target_branch
                );
                let commit = self.fast_path(request, user, &tree).await?;
                Ok(MergedCommit {
                    commit,
                    fast_path: true,
                })
            }
            Ok(TreeMergeOutcome::Conflicts { files }) => {
                info!(
                    "merge of {} into {} conflicts in {} file(s); taking slow path",
                    request.source_commit,
                    request.target_branch,
                    files.len()
                );
                let commit = self.slow_path(request, user).await?;
                Ok(MergedCommit {
                    commit,
                    fast_path: false,
                })
            }
            Err(e) => {
                warn!("merge-tree probe failed ({e}); taking slow path");
                let commit = self.slow_path(request, user).await?;
                Ok(MergedCommit {
                    commit,
                    fast_path: false,
                })
            }
        }
    }

    /// Commit the pre-merged tree and move the target ref to it, stepping
    /// around the user's checkout.
    async fn fast_path(
        &self,
        request: &MergeRequest,
        user: &mut UserState,
        tree: &str,
    ) -> Result<String, MergeError> {
        let repo = &request.repo;
        let target_head = self.git.resolve_ref(repo, &request.target_branch).await?;
        let new_commit = self
            .git
            .commit_tree(repo, tree, &[&target_head], &request.commit_message())
            .await?;

        if user.on_target {
            if user.dirty {
                user.stashed = self
                    .git
                    .stash_push(repo, &format!("pre-merge of {}", request.work_unit))
                    .await?;
            }
            self.git.reset_hard(repo, &new_commit).await?;
            if user.stashed {
                self.git.stash_pop(repo).await?;
                user.stashed = false;
            }
        } else {
            if user.dirty {
                user.stashed = self
                    .git
                    .stash_push(repo, &format!("pre-merge of {}", request.work_unit))
                    .await?;
            }
            self.git.checkout(repo, &request.target_branch).await?;
            self.git.reset_hard(repo, &new_commit).await?;
            self.git.checkout(repo, &user.original_ref).await?;
            if user.stashed {
                self.git.stash_pop(repo).await?;
                user.stashed = false;
            }
        }
        Ok(new_commit)
    }

    /// Check the target out and merge in place; conflicts go to the agent.
    async fn slow_path(
        &self,
        request: &MergeRequest,
        user: &mut UserState,
    ) -> Result<String, MergeError> {
        let repo = &request.repo;
        if user.dirty && !user.stashed {
            user.stashed = self
                .git
                .stash_push(repo, &format!("pre-merge of {}", request.work_unit))
                .await?;
        }
        if !user.on_target {
            self.git.checkout(repo, &request.target_branch).await?;
        }

        let message = request.commit_message();
        let squash = self.config.mode.is_squash();
        match self
            .git
            .merge(repo, &request.source_commit, &message, squash)
            .await?
        {
            MergeOutcome::Clean => {}
            MergeOutcome::Conflicts { files } => {
                self.resolve_with_agent(request, &message, files).await?;
            }
        }

        if !user.on_target {
            self.git.checkout(repo, &user.original_ref).await?;
        }
        if user.stashed {
            self.git.stash_pop(repo).await?;
            user.stashed = false;
        }

        Ok(self.git.resolve_ref(repo, &request.target_branch).await?)
    }

    async fn resolve_with_agent(
        &self,
        request: &MergeRequest,
        message: &str,
        files: Vec<String>,
    ) -> Result<(), MergeError> {
        let prefer = self.config.prefer.as_str();
        let task = format!(
            "Resolve the merge conflicts left by {}. \
             Conflicted files: {}. Prefer the {prefer} side where both changed. \
             Stage the resolutions and complete the merge with the commit message: {message}",
            self.config
                .mode
                .describe(&request.source_commit, &request.target_branch),
            files.join(", "),
        );

        let outcome = self
            .agent
            .delegate(AgentRequest::new(task, request.repo.clone()))
            .await;
        if !outcome.success {
            let _ = self.git.abort_merge(&request.repo).await;
            return Err(MergeError::AgentFailed(
                outcome
                    .error
                    .unwrap_or_else(|| "agent exited unsuccessfully".to_string()),
            ));
        }

        let unmerged = self.git.unmerged_files(&request.repo).await?;
        if !unmerged.is_empty() {
            let _ = self.git.abort_merge(&request.repo).await;
            return Err(MergeError::UnresolvedConflicts { files: unmerged });
        }
        let markers = self.git.files_with_conflict_markers(&request.repo).await?;
        if !markers.is_empty() {
            return Err(MergeError::UnresolvedConflicts { files: markers });
        }

        // The agent may have staged the resolution without committing.
        if self.git.has_staged_changes(&request.repo).await? {
            self.git.commit(&request.repo, message).await?;
        }
        Ok(())
    }

    /// Best-effort rollback after a failed merge; true when the user's
    /// branch and stash were fully restored.
    async fn restore_user_state(&self, request: &MergeRequest, user: &UserState) -> bool {
        let repo = &request.repo;
        let _ = self.git.abort_merge(repo).await;

        let mut restored = true;
        match self.git.current_branch(repo).await {
            Ok(branch) if branch == user.original_ref => {}
            Ok(_) => {
                if self.git.checkout(repo, &user.original_ref).await.is_err() {
                    restored = false;
                }
            }
            Err(_) => restored = false,
        }
        if user.stashed && self.git.stash_pop(repo).await.is_err() {
            restored = false;
        }
        if !restored {
            warn!(
                "could not fully restore user state in {} after failed merge",
                repo.display()
            );
        }
        restored
    }

    async fn push_if_configured(&self, request: &MergeRequest) {
        if !self.config.push_on_success {
            return;
        }
        if let Err(e) = self.git.push(&request.repo, &request.target_branch).await {
            warn!(
                "push of {} to origin failed after merge: {e}",
                request.target_branch
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOutcome;
    use crate::subprocess::{MockProcessRunner, SubprocessManager};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedAgent {
        outcome: AgentOutcome,
        calls: AtomicUsize,
        last_task: std::sync::Mutex<Option<String>>,
    }

    impl ScriptedAgent {
        fn succeeding() -> Self {
            Self {
                outcome: AgentOutcome {
                    success: true,
                    ..Default::default()
                },
                calls: AtomicUsize::new(0),
                last_task: std::sync::Mutex::new(None),
            }
        }

        fn failing() -> Self {
            Self {
                outcome: AgentOutcome::failure("scripted failure"),
                calls: AtomicUsize::new(0),
                last_task: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl AgentDelegator for ScriptedAgent {
        async fn delegate(&self, request: AgentRequest) -> AgentOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_task.lock().unwrap() = Some(request.task);
            self.outcome.clone()
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn request() -> MergeRequest {
        MergeRequest {
            repo: PathBuf::from("/repo"),
            source_commit: "srccommit".into(),
            target_branch: "main".into(),
            work_unit: "job-a".into(),
            message: None,
        }
    }

    fn arg0(args: &[String]) -> Option<&str> {
        args.first().map(String::as_str)
    }

    fn expect_user_state(mock: &MockProcessRunner, branch: &str, dirty: bool) {
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("rev-parse") && args.contains(&"--abbrev-ref".to_string()))
            .returns_stdout(&format!("{branch}\n"))
            .finish();
        let status = if dirty { " M file.rs\n" } else { "" };
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("status"))
            .returns_stdout(status)
            .finish();
    }

    #[tokio::test]
    async fn fast_path_off_target_clean_tree() {
        let (subprocess, mock) = SubprocessManager::mock();
        expect_user_state(&mock, "feature-x", false);
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge-tree"))
            .returns_stdout("treesha\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("rev-parse") && args.contains(&"main^{commit}".to_string()))
            .returns_stdout("targethead\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("commit-tree"))
            .returns_stdout("newcommit\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("checkout"))
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("reset"))
            .finish();

        let coordinator = MergeCoordinator::new(
            GitService::new(subprocess),
            Arc::new(ScriptedAgent::succeeding()),
            MergeConfig::default(),
        );
        let merged = coordinator.merge_to_target(&request()).await.unwrap();
        assert!(merged.fast_path);
        assert_eq!(merged.commit, "newcommit");

        // No stash traffic for a clean tree.
        let stash_calls = mock
            .call_history()
            .iter()
            .filter(|c| arg0(&c.args) == Some("stash"))
            .count();
        assert_eq!(stash_calls, 0);
    }

    #[tokio::test]
    async fn fast_path_on_target_dirty_stashes_and_restores() {
        let (subprocess, mock) = SubprocessManager::mock();
        expect_user_state(&mock, "main", true);
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge-tree"))
            .returns_stdout("treesha\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("rev-parse") && args.contains(&"main^{commit}".to_string()))
            .returns_stdout("targethead\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("commit-tree"))
            .returns_stdout("newcommit\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("stash") && args.contains(&"push".to_string()))
            .returns_stdout("Saved working directory\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("reset"))
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("stash") && args.contains(&"pop".to_string()))
            .finish();

        let coordinator = MergeCoordinator::new(
            GitService::new(subprocess),
            Arc::new(ScriptedAgent::succeeding()),
            MergeConfig::default(),
        );
        let merged = coordinator.merge_to_target(&request()).await.unwrap();
        assert_eq!(merged.commit, "newcommit");

        let history = mock.call_history();
        let stash_push = history
            .iter()
            .position(|c| arg0(&c.args) == Some("stash") && c.args.contains(&"push".to_string()))
            .unwrap();
        let reset = history
            .iter()
            .position(|c| arg0(&c.args) == Some("reset"))
            .unwrap();
        let stash_pop = history
            .iter()
            .position(|c| arg0(&c.args) == Some("stash") && c.args.contains(&"pop".to_string()))
            .unwrap();
        assert!(stash_push < reset && reset < stash_pop);
    }

    #[tokio::test]
    async fn slow_path_agent_resolves_conflicts() {
        let (subprocess, mock) = SubprocessManager::mock();
        expect_user_state(&mock, "feature-x", false);
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge-tree"))
            .returns_stdout("treesha\nsrc/a.rs\n\n")
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("checkout"))
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge") && !args.contains(&"--abort".to_string()))
            .returns_exit_code(1)
            .finish();
        // First unmerged probe feeds MergeOutcome::Conflicts; after the
        // agent runs, both verification probes come back clean.
        mock.expect_command("git")
            .with_args(|args| args.contains(&"--diff-filter=U".to_string()))
            .returns_stdout("src/a.rs\n")
            .times(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.contains(&"--diff-filter=U".to_string()))
            .returns_stdout("")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("grep"))
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("diff") && args.contains(&"--cached".to_string()))
            .returns_exit_code(0)
            .finish();
        mock.expect_command("git")
            .with_args(|args| {
                arg0(args) == Some("rev-parse") && args.contains(&"main^{commit}".to_string())
            })
            .returns_stdout("mergedsha\n")
            .finish();

        let agent = Arc::new(ScriptedAgent::succeeding());
        let coordinator = MergeCoordinator::new(
            GitService::new(subprocess),
            Arc::clone(&agent) as Arc<dyn AgentDelegator>,
            MergeConfig::default(),
        );
        let merged = coordinator.merge_to_target(&request()).await.unwrap();
        assert!(!merged.fast_path);
        assert_eq!(merged.commit, "mergedsha");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rebase_mode_reaches_the_agent_instruction() {
        let (subprocess, mock) = SubprocessManager::mock();
        expect_user_state(&mock, "feature-x", false);
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge-tree"))
            .returns_stdout("treesha\nsrc/a.rs\n\n")
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("checkout"))
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge") && !args.contains(&"--abort".to_string()))
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.contains(&"--diff-filter=U".to_string()))
            .returns_stdout("src/a.rs\n")
            .times(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.contains(&"--diff-filter=U".to_string()))
            .returns_stdout("")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("grep"))
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("diff") && args.contains(&"--cached".to_string()))
            .returns_exit_code(0)
            .finish();
        mock.expect_command("git")
            .with_args(|args| {
                arg0(args) == Some("rev-parse") && args.contains(&"main^{commit}".to_string())
            })
            .returns_stdout("mergedsha\n")
            .finish();

        let agent = Arc::new(ScriptedAgent::succeeding());
        let config = MergeConfig {
            mode: crate::config::MergeMode::Rebase,
            ..Default::default()
        };
        let coordinator = MergeCoordinator::new(
            GitService::new(subprocess),
            Arc::clone(&agent) as Arc<dyn AgentDelegator>,
            config,
        );
        coordinator.merge_to_target(&request()).await.unwrap();

        let task = agent.last_task.lock().unwrap().clone().unwrap();
        assert!(task.contains("rebasing commit srccommit onto branch main"));
        assert!(task.contains("linear"));
        // Rebase mode does not squash.
        let squashed = mock
            .call_history()
            .iter()
            .any(|c| c.args.contains(&"--squash".to_string()));
        assert!(!squashed);
    }

    #[tokio::test]
    async fn agent_failure_restores_user_state() {
        let (subprocess, mock) = SubprocessManager::mock();
        expect_user_state(&mock, "feature-x", false);
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge-tree"))
            .returns_stdout("treesha\nsrc/a.rs\n\n")
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("checkout"))
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge") && !args.contains(&"--abort".to_string()))
            .returns_exit_code(1)
            .finish();
        mock.expect_command("git")
            .with_args(|args| args.contains(&"--diff-filter=U".to_string()))
            .returns_stdout("src/a.rs\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge") && args.contains(&"--abort".to_string()))
            .finish();
        // Restore probe: still on feature-x after abort.
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("rev-parse") && args.contains(&"--abbrev-ref".to_string()))
            .returns_stdout("feature-x\n")
            .finish();

        let coordinator = MergeCoordinator::new(
            GitService::new(subprocess),
            Arc::new(ScriptedAgent::failing()),
            MergeConfig::default(),
        );
        let failure = coordinator.merge_to_target(&request()).await.unwrap_err();
        assert!(matches!(failure.error, MergeError::AgentFailed(_)));
        assert!(failure.user_state_restored);
    }

    #[tokio::test]
    async fn merges_to_same_target_serialize() {
        // Two merges into the same branch must not interleave their git
        // traffic; with a shared coordinator the second waits on the gate.
        let (subprocess, mock) = SubprocessManager::mock();
        expect_user_state(&mock, "feature-x", false);
        expect_user_state(&mock, "feature-x", false);
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("merge-tree"))
            .returns_stdout("treesha\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("rev-parse") && args.contains(&"main^{commit}".to_string()))
            .returns_stdout("targethead\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("commit-tree"))
            .returns_stdout("newcommit\n")
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("checkout"))
            .finish();
        mock.expect_command("git")
            .with_args(|args| arg0(args) == Some("reset"))
            .finish();

        let coordinator = Arc::new(MergeCoordinator::new(
            GitService::new(subprocess),
            Arc::new(ScriptedAgent::succeeding()),
            MergeConfig::default(),
        ));
        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.merge_to_target(&request()).await })
        };
        let second = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.merge_to_target(&request()).await })
        };
        let (a, b) = tokio::join!(first, second);
        assert!(a.unwrap().is_ok());
        assert!(b.unwrap().is_ok());
    }
}
