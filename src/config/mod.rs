//! Configuration for the scheduler.
//!
//! Loaded from `.orchestrator/config.toml` under the workspace when present;
//! every field has a default so an absent file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a leaf's commits are folded into the target branch: the squash flag
/// on the git merge, and how the integration is phrased to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    #[default]
    Merge,
    Rebase,
    Squash,
}

impl MergeMode {
    /// Whether the in-place merge squashes the source commits.
    pub fn is_squash(&self) -> bool {
        matches!(self, MergeMode::Squash)
    }

    /// The integration of `source` into `target`, phrased for agent
    /// instructions. Rebase mode asks for a linear history; the agent owns
    /// the actual resolution either way.
    pub fn describe(&self, source: &str, target: &str) -> String {
        match self {
            MergeMode::Merge => {
                format!("merging commit {source} into branch {target}")
            }
            MergeMode::Rebase => {
                format!(
                    "rebasing commit {source} onto branch {target} (keep the history linear: \
                     re-apply the work on top of {target} rather than adding a merge commit)"
                )
            }
            MergeMode::Squash => {
                format!("squash-merging commit {source} into branch {target} as a single commit")
            }
        }
    }
}

/// Which side the agent is told to prefer when resolving conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergePreference {
    Ours,
    #[default]
    Theirs,
}

impl MergePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergePreference::Ours => "ours",
            MergePreference::Theirs => "theirs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub mode: MergeMode,
    pub prefer: MergePreference,
    /// Push the target branch to origin after each successful merge; also
    /// enables remote branch deletion during cleanup.
    pub push_on_success: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            mode: MergeMode::default(),
            prefer: MergePreference::default(),
            push_on_success: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCliConfig {
    /// Program (plus leading args) used for agent delegation.
    pub program: String,
    /// Fail preflight when the agent CLI cannot be detected.
    pub enforce_in_jobs: bool,
}

impl Default for AgentCliConfig {
    fn default() -> Self {
        Self {
            program: "copilot".to_string(),
            enforce_in_jobs: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    /// Outcome for a restart-recovered job whose surviving PIDs all exit:
    /// Succeeded when true (best-effort, exit codes unknown), Failed when
    /// false. No commit SHA is fabricated either way.
    pub complete_as_success: bool,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            complete_as_success: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Upper bound on simultaneously running work units per scheduler.
    /// 0 means auto: CPU count minus one.
    pub max_parallel: usize,
    pub merge: MergeConfig,
    pub agent_cli: AgentCliConfig,
    pub orphan: OrphanConfig,
}

impl Config {
    /// Load from `<workspace>/.orchestrator/config.toml`, falling back to
    /// defaults when the file is absent.
    pub fn load(workspace: &Path) -> anyhow::Result<Self> {
        let path = workspace.join(".orchestrator").join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Effective concurrency bound: configured value, or CPU count minus one
    /// (at least 1) when unset.
    pub fn effective_parallelism(&self) -> usize {
        resolve_parallelism(self.max_parallel)
    }
}

pub fn resolve_parallelism(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|p| p.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}
