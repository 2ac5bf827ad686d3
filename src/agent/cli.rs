//! Production agent delegation via the configured CLI.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::session::try_extract_session_id;
use super::{AgentDelegator, AgentOutcome, AgentRequest};
use crate::subprocess::{ProcessCommandBuilder, ProcessError, SubprocessManager};

/// Name of the share artifact some agent CLI versions drop in the worktree
/// instead of printing the session to stdout.
const SHARE_ARTIFACT: &str = "session.share";

pub struct CliAgentDelegator {
    subprocess: SubprocessManager,
    /// Program plus leading arguments, e.g. `"copilot"` or
    /// `"copilot --allow-all-tools"`.
    program: String,
}

impl CliAgentDelegator {
    pub fn new(subprocess: SubprocessManager, program: impl Into<String>) -> Self {
        Self {
            subprocess,
            program: program.into(),
        }
    }

    fn argv(&self) -> Result<Vec<String>, String> {
        let parts = shell_words::split(&self.program)
            .map_err(|e| format!("invalid agent command line {:?}: {e}", self.program))?;
        if parts.is_empty() {
            return Err("agent command line is empty".to_string());
        }
        Ok(parts)
    }

    fn prompt_for(request: &AgentRequest) -> String {
        match &request.instructions {
            Some(instructions) if !instructions.trim().is_empty() => {
                format!("{}\n\n{}", request.task, instructions)
            }
            _ => request.task.clone(),
        }
    }

    fn share_artifact_session(worktree: &Path) -> Option<String> {
        let path = worktree.join(SHARE_ARTIFACT);
        let contents = std::fs::read_to_string(path).ok()?;
        try_extract_session_id(&contents)
    }
}

#[async_trait]
impl AgentDelegator for CliAgentDelegator {
    async fn delegate(&self, request: AgentRequest) -> AgentOutcome {
        let mut argv = match self.argv() {
            Ok(argv) => argv,
            Err(error) => return AgentOutcome::failure(error),
        };
        let program = argv.remove(0);

        argv.push("-p".to_string());
        argv.push(Self::prompt_for(&request));
        if let Some(session) = &request.session_id {
            argv.push("--resume".to_string());
            argv.push(session.clone());
        }

        let command = ProcessCommandBuilder::new(&program)
            .args(argv.iter().map(String::as_str))
            .current_dir(&request.worktree_path)
            .timeout(request.timeout)
            .build();

        let mut spawned = match self.subprocess.runner().spawn(command).await {
            Ok(spawned) => spawned,
            Err(ProcessError::CommandNotFound(name)) => {
                return AgentOutcome::failure(format!("agent CLI not found: {name}"));
            }
            Err(e) => return AgentOutcome::failure(format!("failed to spawn agent CLI: {e}")),
        };

        if let (Some(hook), Some(pid)) = (&request.on_process, spawned.pid) {
            hook(pid);
        }

        let mut collected = String::new();
        let mut session_id = request.session_id.clone();
        while let Some(line) = spawned.lines.recv().await {
            if session_id.is_none() {
                session_id = try_extract_session_id(&line);
            }
            if let Some(sink) = &request.log_output {
                sink(&line);
            }
            collected.push_str(&line);
            collected.push('\n');
        }

        let status = match spawned.status.await {
            Ok(status) => status,
            Err(ProcessError::Timeout(limit)) => {
                warn!("agent call timed out after {limit:?}");
                return AgentOutcome {
                    success: false,
                    session_id,
                    exit_code: None,
                    error: Some(format!("agent call timed out after {limit:?}")),
                };
            }
            Err(e) => return AgentOutcome::failure(format!("agent process error: {e}")),
        };

        if session_id.is_none() {
            session_id = try_extract_session_id(&collected)
                .or_else(|| Self::share_artifact_session(&request.worktree_path));
        }

        if status.success() {
            debug!("agent delegation completed, session {session_id:?}");
            AgentOutcome {
                success: true,
                session_id,
                exit_code: Some(0),
                error: None,
            }
        } else {
            AgentOutcome {
                success: false,
                session_id,
                exit_code: status.code(),
                error: Some(format!(
                    "agent CLI exited with {}",
                    status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string())
                )),
            }
        }
    }

    async fn is_available(&self) -> bool {
        let Ok(mut argv) = self.argv() else {
            return false;
        };
        let program = argv.remove(0);
        let command = ProcessCommandBuilder::new(&program)
            .arg("--version")
            .timeout(Duration::from_secs(10))
            .build();
        matches!(
            self.subprocess.runner().run(command).await,
            Ok(output) if output.status.success()
        )
    }

    async fn suggest_commit_message(&self, worktree: &Path, task: &str) -> Option<String> {
        let mut argv = self.argv().ok()?;
        let program = argv.remove(0);
        argv.push("-p".to_string());
        argv.push(format!(
            "Write a one-line git commit message (no quotes, no trailing period) \
             for the staged changes produced by this task: {task}. \
             Print only the message."
        ));

        let command = ProcessCommandBuilder::new(&program)
            .args(argv.iter().map(String::as_str))
            .current_dir(worktree)
            .timeout(Duration::from_secs(60))
            .build();

        let output = self.subprocess.runner().run(command).await.ok()?;
        if !output.status.success() {
            return None;
        }
        output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::SubprocessManager;
    use std::sync::{Arc, Mutex};

    const ID: &str = "6f9619ff-8b86-4d01-b42d-00cf4fc964ff";

    #[tokio::test]
    async fn delegation_captures_session_and_pid() {
        let (subprocess, mock) = SubprocessManager::mock();
        mock.expect_command("copilot")
            .returns_stdout(&format!("Session ID: {ID}\nall done"))
            .finish();

        let delegator = CliAgentDelegator::new(subprocess, "copilot");
        let seen_pid = Arc::new(Mutex::new(None));
        let seen_lines = Arc::new(Mutex::new(Vec::new()));

        let mut request = AgentRequest::new("fix the tests", "/tmp/worktree");
        let pid_slot = Arc::clone(&seen_pid);
        request.on_process = Some(Arc::new(move |pid| {
            *pid_slot.lock().unwrap() = Some(pid);
        }));
        let line_slot = Arc::clone(&seen_lines);
        request.log_output = Some(Arc::new(move |line: &str| {
            line_slot.lock().unwrap().push(line.to_string());
        }));

        let outcome = delegator.delegate(request).await;
        assert!(outcome.success);
        assert_eq!(outcome.session_id.as_deref(), Some(ID));
        assert!(seen_pid.lock().unwrap().is_some());
        assert_eq!(seen_lines.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delegation_failure_reports_exit_code() {
        let (subprocess, mock) = SubprocessManager::mock();
        mock.expect_command("copilot").returns_exit_code(2).finish();

        let delegator = CliAgentDelegator::new(subprocess, "copilot");
        let outcome = delegator
            .delegate(AgentRequest::new("task", "/tmp/worktree"))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(2));
        assert!(outcome.error.unwrap().contains("exited with 2"));
    }

    #[tokio::test]
    async fn missing_cli_is_a_failure_outcome() {
        let (subprocess, _mock) = SubprocessManager::mock();
        // No expectation registered: the mock refuses, which the delegator
        // reports as a failure rather than propagating.
        let delegator = CliAgentDelegator::new(subprocess, "copilot");
        let outcome = delegator
            .delegate(AgentRequest::new("task", "/tmp/worktree"))
            .await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn resume_passes_prior_session() {
        let (subprocess, mock) = SubprocessManager::mock();
        mock.expect_command("copilot")
            .with_args(|args| args.iter().any(|a| a == "--resume"))
            .finish();

        let delegator = CliAgentDelegator::new(subprocess.clone(), "copilot");
        let mut request = AgentRequest::new("continue", "/tmp/worktree");
        request.session_id = Some(ID.to_string());
        let outcome = delegator.delegate(request).await;
        assert!(outcome.success);
        assert_eq!(outcome.session_id.as_deref(), Some(ID));
    }

    #[tokio::test]
    async fn commit_message_takes_first_nonempty_line() {
        let (subprocess, mock) = SubprocessManager::mock();
        mock.expect_command("copilot")
            .returns_stdout("\n  Add retry support to the fetcher  \n")
            .finish();

        let delegator = CliAgentDelegator::new(subprocess, "copilot");
        let message = delegator
            .suggest_commit_message(Path::new("/tmp/worktree"), "add retries")
            .await;
        assert_eq!(message.as_deref(), Some("Add retry support to the fetcher"));
    }
}
