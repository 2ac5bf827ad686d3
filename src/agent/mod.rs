//! Delegation seam for the external agent CLI.
//!
//! Phases whose command starts with `@agent` or `@copilot` are handed to an
//! [`AgentDelegator`] rather than the shell. The scheduler only depends on
//! the trait; the production implementation spawns the configured CLI in
//! the job's worktree, and tests substitute scripted outcomes.

pub mod cli;
pub mod session;

pub use cli::CliAgentDelegator;
pub use session::try_extract_session_id;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with the PID of each process the delegator spawns, so
/// the scheduler can register it for cancellation and crash recovery.
pub type ProcessHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Callback receiving the delegator's output line by line.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Default deadline for a single agent invocation.
pub const AGENT_CALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct AgentRequest {
    /// What the agent is being asked to do.
    pub task: String,
    /// Extra instructions appended to the task, if any.
    pub instructions: Option<String>,
    /// Worktree the agent operates in.
    pub worktree_path: PathBuf,
    /// Session to resume, when a prior delegation captured one.
    pub session_id: Option<String>,
    pub timeout: Duration,
    pub on_process: Option<ProcessHook>,
    pub log_output: Option<OutputSink>,
}

impl AgentRequest {
    pub fn new(task: impl Into<String>, worktree_path: impl Into<PathBuf>) -> Self {
        Self {
            task: task.into(),
            instructions: None,
            worktree_path: worktree_path.into(),
            session_id: None,
            timeout: AGENT_CALL_TIMEOUT,
            on_process: None,
            log_output: None,
        }
    }
}

/// What a delegation produced. Failures are data, not panics: spawn errors
/// and timeouts land in `error` with `success = false`.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub success: bool,
    pub session_id: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait AgentDelegator: Send + Sync {
    /// Run the agent against the request's worktree and wait for it.
    async fn delegate(&self, request: AgentRequest) -> AgentOutcome;

    /// Whether the agent CLI can be detected at all (preflight check).
    async fn is_available(&self) -> bool;

    /// One-line commit message for the staged changes, if the agent can
    /// produce one. Callers fall back to a deterministic message on `None`.
    async fn suggest_commit_message(&self, _worktree: &std::path::Path, _task: &str) -> Option<String> {
        None
    }
}
