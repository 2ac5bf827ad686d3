//! The phase executor: drives one job through the phase pipeline.
//!
//! `preflight → [prechecks] → work → commit → [postchecks] → mergeback →
//! cleanup`. Bracketed phases are skipped when their command is empty; an
//! empty `work` is a hard failure; plan-managed jobs leave mergeback and
//! cleanup to their plan. Cancellation is observed at phase boundaries.

use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::logfile::AttemptLog;
use super::types::{
    parse_phase_command, JobState, JobStatus, Phase, PhaseCommand, StepStatus,
};
use crate::agent::{AgentDelegator, AgentRequest};
use crate::config::Config;
use crate::git::GitService;
use crate::merge::{MergeCoordinator, MergeRequest};
use crate::subprocess::{ProcessCommandBuilder, SubprocessManager};

pub type SharedJob = Arc<Mutex<JobState>>;
pub type PersistHook = Arc<dyn Fn() + Send + Sync>;

/// Collaborators the executor drives phases through.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub subprocess: SubprocessManager,
    pub git: GitService,
    pub agent: Arc<dyn AgentDelegator>,
    pub merge: Arc<MergeCoordinator>,
    pub config: Config,
}

/// Platform-default shell invocation for a phase command string.
pub fn shell_invocation(command: &str) -> (String, Vec<String>) {
    if cfg!(windows) {
        ("cmd".to_string(), vec!["/C".to_string(), command.to_string()])
    } else {
        ("sh".to_string(), vec!["-c".to_string(), command.to_string()])
    }
}

enum PhaseResult {
    Success,
    Skipped,
    Failed(String),
}

pub struct PhaseExecutor {
    deps: ExecutorDeps,
    persist: PersistHook,
}

impl PhaseExecutor {
    pub fn new(deps: ExecutorDeps, persist: PersistHook) -> Self {
        Self { deps, persist }
    }

    /// Drive the job's current attempt through the phase sequence. The
    /// job's status and attempt record are settled on return.
    pub async fn run(&self, job: SharedJob, log: AttemptLog) {
        let (job_id, worktree) = {
            let state = job.lock().unwrap();
            (
                state.spec.runner_job_id.clone(),
                state.spec.inputs.worktree_path.clone(),
            )
        };

        let mut terminal = JobStatus::Succeeded;
        for phase in Phase::SEQUENCE {
            if self.canceled(&job) {
                terminal = JobStatus::Canceled;
                break;
            }

            {
                let mut state = job.lock().unwrap();
                state.current_phase = Some(phase);
                state.touch();
            }
            (self.persist)();
            log.section_start(phase);

            let result = self
                .run_phase(phase, &job, worktree.as_deref(), &log)
                .await;
            log.section_end(phase);

            match result {
                PhaseResult::Success => {
                    job.lock().unwrap().record_step(phase, StepStatus::Success);
                }
                PhaseResult::Skipped => {
                    job.lock().unwrap().record_step(phase, StepStatus::Skipped);
                }
                PhaseResult::Failed(reason) => {
                    warn!("job {job_id}: {phase} phase failed: {reason}");
                    log.append(phase, &format!("phase failed: {reason}"));
                    let mut state = job.lock().unwrap();
                    state.record_step(phase, StepStatus::Failed);
                    if let Some(attempt) = state.current_attempt_mut() {
                        attempt.failure_reason = Some(format!("{phase}: {reason}"));
                    }
                    terminal = JobStatus::Failed;
                    break;
                }
            }
            (self.persist)();
        }

        // A cancel that raced the last phase still wins.
        if self.canceled(&job) {
            terminal = JobStatus::Canceled;
        }

        {
            let mut state = job.lock().unwrap();
            state.status = terminal;
            state.current_phase = None;
            state.process_ids.clear();
            if let Some(attempt) = state.current_attempt_mut() {
                attempt.finish(terminal);
            }
            state.touch();
        }
        if let Err(e) = log.flush() {
            warn!("job {job_id}: failed to flush attempt log: {e}");
        }
        (self.persist)();
    }

    fn canceled(&self, job: &SharedJob) -> bool {
        job.lock().unwrap().status == JobStatus::Canceled
    }

    async fn run_phase(
        &self,
        phase: Phase,
        job: &SharedJob,
        worktree: Option<&Path>,
        log: &AttemptLog,
    ) -> PhaseResult {
        match phase {
            Phase::Preflight => self.preflight(job, worktree).await,
            Phase::Prechecks => {
                let command = job.lock().unwrap().spec.policy.prechecks.clone();
                // A pass carried over from a prior attempt is not re-run.
                if job.lock().unwrap().current_attempt().map(|a| a.step(Phase::Prechecks))
                    == Some(StepStatus::Skipped)
                {
                    return PhaseResult::Skipped;
                }
                self.run_command_phase(phase, &command, false, job, worktree, log)
                    .await
            }
            Phase::Work => {
                let command = job.lock().unwrap().spec.policy.work.clone();
                self.run_command_phase(phase, &command, true, job, worktree, log)
                    .await
            }
            Phase::Commit => self.commit(job, worktree, log).await,
            Phase::Postchecks => {
                let command = job.lock().unwrap().spec.policy.postchecks.clone();
                self.run_command_phase(phase, &command, false, job, worktree, log)
                    .await
            }
            Phase::Mergeback => self.mergeback(job, worktree, log).await,
            Phase::Cleanup => self.cleanup(job, worktree, log).await,
        }
    }

    async fn preflight(&self, job: &SharedJob, worktree: Option<&Path>) -> PhaseResult {
        let Some(worktree) = worktree else {
            return PhaseResult::Failed("no worktree path configured".to_string());
        };
        if !self.deps.git.is_valid_worktree(worktree).await {
            return PhaseResult::Failed(format!(
                "worktree path is not a valid worktree: {}",
                worktree.display()
            ));
        }
        if self.deps.config.agent_cli.enforce_in_jobs && !self.deps.agent.is_available().await {
            return PhaseResult::Failed("agent CLI not detected".to_string());
        }
        let _ = job;
        PhaseResult::Success
    }

    async fn run_command_phase(
        &self,
        phase: Phase,
        raw: &str,
        required: bool,
        job: &SharedJob,
        worktree: Option<&Path>,
        log: &AttemptLog,
    ) -> PhaseResult {
        let Some(worktree) = worktree else {
            return PhaseResult::Failed("no worktree path configured".to_string());
        };
        match parse_phase_command(raw) {
            PhaseCommand::Skip if required => {
                PhaseResult::Failed("work phase requires a command".to_string())
            }
            PhaseCommand::Skip => PhaseResult::Skipped,
            PhaseCommand::Shell(command) => {
                self.run_shell(phase, command, job, worktree, log).await
            }
            PhaseCommand::Agent { prompt } => {
                self.run_agent(phase, prompt, job, worktree, log).await
            }
        }
    }

    async fn run_shell(
        &self,
        phase: Phase,
        command: &str,
        job: &SharedJob,
        worktree: &Path,
        log: &AttemptLog,
    ) -> PhaseResult {
        log.append(phase, &format!("$ {command}"));
        let (program, args) = shell_invocation(command);
        let process = ProcessCommandBuilder::new(&program)
            .args(args.iter().map(String::as_str))
            .current_dir(worktree)
            .build();

        let mut spawned = match self.deps.subprocess.runner().spawn(process).await {
            Ok(spawned) => spawned,
            Err(e) => return PhaseResult::Failed(format!("failed to spawn: {e}")),
        };

        if let Some(pid) = spawned.pid {
            job.lock().unwrap().process_ids.push(pid);
            (self.persist)();
        }

        while let Some(line) = spawned.lines.recv().await {
            log.append(phase, &line);
        }

        let status = spawned.status.await;
        {
            let mut state = job.lock().unwrap();
            state.process_ids.clear();
            state.touch();
        }

        match status {
            Ok(status) if status.success() => PhaseResult::Success,
            Ok(status) => PhaseResult::Failed(format!(
                "command exited with {}",
                status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            )),
            Err(e) => PhaseResult::Failed(format!("process error: {e}")),
        }
    }

    async fn run_agent(
        &self,
        phase: Phase,
        prompt: &str,
        job: &SharedJob,
        worktree: &Path,
        log: &AttemptLog,
    ) -> PhaseResult {
        let (task, instructions, session_id) = {
            let state = job.lock().unwrap();
            let task = if prompt.is_empty() {
                state.spec.task.clone()
            } else {
                prompt.to_string()
            };
            (task, compose_instructions(&state), state.agent_session_id.clone())
        };

        let mut request = AgentRequest::new(task, worktree.to_path_buf());
        request.instructions = instructions;
        request.session_id = session_id;

        let job_for_pid = Arc::clone(job);
        let persist = Arc::clone(&self.persist);
        request.on_process = Some(Arc::new(move |pid| {
            job_for_pid.lock().unwrap().process_ids.push(pid);
            persist();
        }));
        let log_for_lines = log.clone();
        request.log_output = Some(Arc::new(move |line: &str| {
            log_for_lines.append(phase, line);
        }));

        let outcome = self.deps.agent.delegate(request).await;
        {
            let mut state = job.lock().unwrap();
            state.process_ids.clear();
            if let Some(session) = &outcome.session_id {
                state.agent_session_id = Some(session.clone());
            }
            state.touch();
        }

        if outcome.success {
            PhaseResult::Success
        } else {
            PhaseResult::Failed(
                outcome
                    .error
                    .unwrap_or_else(|| "agent delegation failed".to_string()),
            )
        }
    }

    /// Stage everything and commit; nothing to commit is still success.
    /// HEAD after this phase is the job's completed commit.
    async fn commit(
        &self,
        job: &SharedJob,
        worktree: Option<&Path>,
        log: &AttemptLog,
    ) -> PhaseResult {
        let Some(worktree) = worktree else {
            return PhaseResult::Failed("no worktree path configured".to_string());
        };
        if let Err(e) = self.deps.git.stage_all(worktree).await {
            return PhaseResult::Failed(format!("failed to stage changes: {e}"));
        }

        let staged = match self.deps.git.has_staged_changes(worktree).await {
            Ok(staged) => staged,
            Err(e) => return PhaseResult::Failed(e.to_string()),
        };

        if staged {
            let (name, task) = {
                let state = job.lock().unwrap();
                (state.spec.name.clone(), state.spec.task.clone())
            };
            let message = match self.deps.agent.suggest_commit_message(worktree, &task).await {
                Some(message) => message,
                None => format!("{name}: {task}"),
            };
            log.append(Phase::Commit, &format!("committing: {message}"));
            if let Err(e) = self.deps.git.commit(worktree, &message).await {
                return PhaseResult::Failed(format!("commit failed: {e}"));
            }
        } else {
            log.append(Phase::Commit, "nothing to commit");
        }

        match self.deps.git.head(worktree).await {
            Ok(sha) => {
                debug!("job completed commit {sha}");
                let mut state = job.lock().unwrap();
                state.completed_commit = Some(sha);
                state.touch();
                PhaseResult::Success
            }
            Err(e) => PhaseResult::Failed(format!("failed to resolve HEAD: {e}")),
        }
    }

    async fn mergeback(
        &self,
        job: &SharedJob,
        worktree: Option<&Path>,
        log: &AttemptLog,
    ) -> PhaseResult {
        let (plan_managed, target, commit, name) = {
            let state = job.lock().unwrap();
            (
                state.spec.inputs.is_plan_managed,
                state.spec.inputs.target_branch.clone(),
                state.completed_commit.clone(),
                state.spec.name.clone(),
            )
        };
        if plan_managed {
            return PhaseResult::Skipped;
        }
        let Some(target) = target else {
            return PhaseResult::Skipped;
        };
        let Some(worktree) = worktree else {
            return PhaseResult::Failed("no worktree path configured".to_string());
        };
        let Some(commit) = commit else {
            return PhaseResult::Failed("no completed commit to merge".to_string());
        };

        let repo = match self.deps.git.main_repo_of(worktree).await {
            Ok(repo) => repo,
            Err(e) => return PhaseResult::Failed(e.to_string()),
        };
        let request = MergeRequest {
            repo,
            source_commit: commit,
            target_branch: target.clone(),
            work_unit: name,
            message: None,
        };
        match self.deps.merge.merge_to_target(&request).await {
            Ok(merged) => {
                log.append(
                    Phase::Mergeback,
                    &format!("merged into {target} as {}", merged.commit),
                );
                PhaseResult::Success
            }
            Err(failure) => PhaseResult::Failed(failure.to_string()),
        }
    }

    async fn cleanup(
        &self,
        job: &SharedJob,
        worktree: Option<&Path>,
        log: &AttemptLog,
    ) -> PhaseResult {
        if job.lock().unwrap().spec.inputs.is_plan_managed {
            return PhaseResult::Skipped;
        }
        let Some(worktree) = worktree else {
            return PhaseResult::Skipped;
        };
        let repo = match self.deps.git.main_repo_of(worktree).await {
            Ok(repo) => repo,
            Err(e) => {
                // Cleanup failures are non-fatal; the reaper retries later.
                warn!("cleanup could not locate main repo: {e}");
                return PhaseResult::Success;
            }
        };
        if self.deps.git.remove_worktree_safe(&repo, worktree, true).await {
            log.append(Phase::Cleanup, "worktree removed");
        } else {
            warn!("worktree {} not removed; will be retried", worktree.display());
        }
        PhaseResult::Success
    }
}

/// Extra context handed to agent work phases: the job's standing
/// instructions plus the most recent retry instruction, if either exists.
fn compose_instructions(state: &JobState) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(extra) = &state.spec.inputs.additional_instructions {
        if !extra.trim().is_empty() {
            parts.push(extra.trim().to_string());
        }
    }
    if let Some(latest) = state.latest_instruction() {
        if !latest.trim().is_empty() {
            parts.push(latest.trim().to_string());
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}
