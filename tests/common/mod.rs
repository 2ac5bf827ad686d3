#![allow(dead_code)]

//! Shared fixtures for integration tests: throwaway git repositories and
//! scripted agent delegators.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use foreman::agent::{AgentDelegator, AgentOutcome, AgentRequest};

/// Run git in `dir`, panicking on failure; returns trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git is installed");
    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Initialize a repository on branch `main` with one commit.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "tests@example.com"]);
    git(dir, &["config", "user.name", "Tests"]);
    std::fs::write(dir.join("README.md"), "seed\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "initial commit"]);
}

pub fn commit_file(dir: &Path, name: &str, contents: &str, message: &str) -> String {
    std::fs::write(dir.join(name), contents).unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
    git(dir, &["rev-parse", "HEAD"])
}

pub fn show_file(dir: &Path, reference: &str, path: &str) -> String {
    git(dir, &["show", &format!("{reference}:{path}")])
}

pub fn rev_count(dir: &Path, reference: &str) -> usize {
    git(dir, &["rev-list", "--count", reference])
        .parse()
        .unwrap()
}

/// An agent that reports available and succeeds without doing anything.
pub struct StubAgent;

#[async_trait]
impl AgentDelegator for StubAgent {
    async fn delegate(&self, _request: AgentRequest) -> AgentOutcome {
        AgentOutcome {
            success: true,
            ..Default::default()
        }
    }

    async fn is_available(&self) -> bool {
        true
    }
}

/// An agent that resolves merge conflicts by taking the incoming side and
/// completing the merge, the way a real delegated agent would.
pub struct ResolvingAgent;

#[async_trait]
impl AgentDelegator for ResolvingAgent {
    async fn delegate(&self, request: AgentRequest) -> AgentOutcome {
        let repo = &request.worktree_path;
        for step in [
            vec!["checkout", "--theirs", "--", "."],
            vec!["add", "-A"],
            vec!["commit", "-m", "Resolve merge conflicts"],
        ] {
            let output = Command::new("git")
                .args(&step)
                .current_dir(repo)
                .output()
                .expect("git is installed");
            if !output.status.success() {
                return AgentOutcome::failure(format!(
                    "git {step:?} failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                ));
            }
        }
        AgentOutcome {
            success: true,
            ..Default::default()
        }
    }

    async fn is_available(&self) -> bool {
        true
    }
}

/// An agent that always fails, for exercising failure paths.
pub struct FailingAgent;

#[async_trait]
impl AgentDelegator for FailingAgent {
    async fn delegate(&self, _request: AgentRequest) -> AgentOutcome {
        AgentOutcome::failure("scripted agent failure")
    }

    async fn is_available(&self) -> bool {
        true
    }
}

pub fn arc_agent<A: AgentDelegator + 'static>(agent: A) -> Arc<dyn AgentDelegator> {
    Arc::new(agent)
}

/// Path helper: a repo and workspace under one tempdir.
pub struct Fixture {
    pub _tempdir: tempfile::TempDir,
    pub repo: PathBuf,
    pub workspace: PathBuf,
}

pub fn fixture() -> Fixture {
    let tempdir = tempfile::tempdir().unwrap();
    let repo = tempdir.path().join("repo");
    let workspace = tempdir.path().join("workspace");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::create_dir_all(&workspace).unwrap();
    init_repo(&repo);
    Fixture {
        _tempdir: tempdir,
        repo,
        workspace,
    }
}
