//! Job specifications and runtime state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Runner-scoped job identifier (a UUID assigned at admission).
pub type JobId = String;

/// Immutable definition of one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Plan-local id; equals `runner_job_id` for standalone jobs.
    pub id: String,
    pub runner_job_id: JobId,
    pub name: String,
    /// What the work is about; used in agent prompts and fallback commit
    /// messages.
    pub task: String,
    /// Sibling ids (jobs or sub-plans) whose committed output this job
    /// builds on.
    #[serde(default)]
    pub consumes_from: Vec<String>,
    #[serde(default)]
    pub inputs: JobInputs,
    #[serde(default)]
    pub policy: JobPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobInputs {
    pub base_branch: Option<String>,
    pub target_branch: Option<String>,
    pub worktree_root: Option<String>,
    pub additional_instructions: Option<String>,
    /// Plan-managed jobs get a pre-created worktree and leave mergeback and
    /// cleanup to the plan.
    pub is_plan_managed: bool,
    pub worktree_path: Option<PathBuf>,
}

/// Per-phase command strings (§ phase-command grammar): empty means
/// skipped (except `work`, where it is a hard failure), `@agent`/`@copilot`
/// prefixes delegate, anything else runs in the platform shell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPolicy {
    pub prechecks: String,
    pub work: String,
    pub postchecks: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Preparing,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Preflight,
    Prechecks,
    Work,
    Commit,
    Postchecks,
    Mergeback,
    Cleanup,
}

impl Phase {
    pub const SEQUENCE: [Phase; 7] = [
        Phase::Preflight,
        Phase::Prechecks,
        Phase::Work,
        Phase::Commit,
        Phase::Postchecks,
        Phase::Mergeback,
        Phase::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::Prechecks => "prechecks",
            Phase::Work => "work",
            Phase::Commit => "commit",
            Phase::Postchecks => "postchecks",
            Phase::Mergeback => "mergeback",
            Phase::Cleanup => "cleanup",
        }
    }

    /// Upper-case form used in log section markers.
    pub fn marker(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    Absent,
}

/// Parsed form of a phase command string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseCommand<'a> {
    Skip,
    Agent { prompt: &'a str },
    Shell(&'a str),
}

pub fn parse_phase_command(raw: &str) -> PhaseCommand<'_> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return PhaseCommand::Skip;
    }
    for sigil in ["@agent", "@copilot"] {
        if let Some(rest) = trimmed.strip_prefix(sigil) {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return PhaseCommand::Agent {
                    prompt: rest.trim(),
                };
            }
        }
    }
    PhaseCommand::Shell(trimmed)
}

/// One execution pass of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub log_file: PathBuf,
    /// Phase name → outcome for this attempt.
    #[serde(default)]
    pub steps: BTreeMap<String, StepStatus>,
    pub status: JobStatus,
    pub work_summary: Option<WorkSummary>,
    /// Instruction snapshot this attempt ran with, if any.
    pub work_instruction: Option<String>,
    /// Why the attempt ended, when it did not succeed.
    pub failure_reason: Option<String>,
}

impl Attempt {
    pub fn new(attempt_id: String, log_file: PathBuf) -> Self {
        Self {
            attempt_id,
            started_at: Utc::now(),
            ended_at: None,
            log_file,
            steps: BTreeMap::new(),
            status: JobStatus::Running,
            work_summary: None,
            work_instruction: None,
            failure_reason: None,
        }
    }

    pub fn step(&self, phase: Phase) -> StepStatus {
        self.steps
            .get(phase.as_str())
            .copied()
            .unwrap_or(StepStatus::Absent)
    }

    pub fn set_step(&mut self, phase: Phase, status: StepStatus) {
        self.steps.insert(phase.as_str().to_string(), status);
    }

    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

/// Mutable runtime view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    #[serde(flatten)]
    pub spec: JobSpec,
    pub status: JobStatus,
    pub current_phase: Option<Phase>,
    /// Current attempt's log file, mirrored at the job level.
    pub log_file: Option<PathBuf>,
    pub current_attempt_id: Option<String>,
    /// Phase name → outcome of the latest attempt, mirrored for quick
    /// inspection of the persisted file.
    #[serde(default)]
    pub step_statuses: BTreeMap<String, StepStatus>,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    /// Instructions, most recent last.
    #[serde(default)]
    pub work_history: Vec<String>,
    /// PIDs of currently-spawned children.
    #[serde(default)]
    pub process_ids: Vec<u32>,
    pub completed_commit: Option<String>,
    pub agent_session_id: Option<String>,
    pub work_summary: Option<WorkSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            spec,
            status: JobStatus::Queued,
            current_phase: None,
            log_file: None,
            current_attempt_id: None,
            step_statuses: BTreeMap::new(),
            attempts: Vec::new(),
            work_history: Vec::new(),
            process_ids: Vec::new(),
            completed_commit: None,
            agent_session_id: None,
            work_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut Attempt> {
        let id = self.current_attempt_id.clone()?;
        self.attempts.iter_mut().find(|a| a.attempt_id == id)
    }

    pub fn current_attempt(&self) -> Option<&Attempt> {
        let id = self.current_attempt_id.as_deref()?;
        self.attempts.iter().find(|a| a.attempt_id == id)
    }

    /// Whether any attempt already passed prechecks (carried on retry).
    pub fn prechecks_passed(&self) -> bool {
        self.attempts
            .iter()
            .any(|a| a.step(Phase::Prechecks) == StepStatus::Success)
    }

    pub fn latest_instruction(&self) -> Option<&str> {
        self.work_history.last().map(String::as_str)
    }

    pub fn record_step(&mut self, phase: Phase, status: StepStatus) {
        self.step_statuses.insert(phase.as_str().to_string(), status);
        if let Some(attempt) = self.current_attempt_mut() {
            attempt.set_step(phase, status);
        }
        self.touch();
    }
}

/// Counts folded monoidally across merged leaves into the plan's aggregated
/// summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSummary {
    pub commits: usize,
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

impl WorkSummary {
    pub fn absorb(&mut self, other: &WorkSummary) {
        self.commits += other.commits;
        self.files_changed += other.files_changed;
        self.insertions += other.insertions;
        self.deletions += other.deletions;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_command_grammar() {
        assert_eq!(parse_phase_command(""), PhaseCommand::Skip);
        assert_eq!(parse_phase_command("   "), PhaseCommand::Skip);
        assert_eq!(
            parse_phase_command("cargo test"),
            PhaseCommand::Shell("cargo test")
        );
        assert_eq!(
            parse_phase_command("@agent fix the flaky test"),
            PhaseCommand::Agent {
                prompt: "fix the flaky test"
            }
        );
        assert_eq!(
            parse_phase_command("@copilot add docs"),
            PhaseCommand::Agent { prompt: "add docs" }
        );
        assert_eq!(parse_phase_command("@agent"), PhaseCommand::Agent { prompt: "" });
        // A sigil must be a whole word, not a prefix of something else.
        assert_eq!(
            parse_phase_command("@agentsmith run"),
            PhaseCommand::Shell("@agentsmith run")
        );
    }

    #[test]
    fn phase_sequence_is_complete_and_ordered() {
        let names: Vec<&str> = Phase::SEQUENCE.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "preflight",
                "prechecks",
                "work",
                "commit",
                "postchecks",
                "mergeback",
                "cleanup"
            ]
        );
        assert_eq!(Phase::Work.marker(), "WORK");
    }

    #[test]
    fn attempt_steps_default_absent() {
        let mut attempt = Attempt::new("a1".into(), PathBuf::from("/tmp/a1.log"));
        assert_eq!(attempt.step(Phase::Work), StepStatus::Absent);
        attempt.set_step(Phase::Work, StepStatus::Success);
        assert_eq!(attempt.step(Phase::Work), StepStatus::Success);
    }

    #[test]
    fn prechecks_carry_is_visible_across_attempts() {
        let spec = JobSpec {
            id: "j1".into(),
            runner_job_id: "r1".into(),
            name: "demo".into(),
            task: "demo task".into(),
            consumes_from: vec![],
            inputs: JobInputs::default(),
            policy: JobPolicy::default(),
        };
        let mut state = JobState::new(spec);
        assert!(!state.prechecks_passed());

        let mut attempt = Attempt::new("a1".into(), PathBuf::from("/tmp/a1.log"));
        attempt.set_step(Phase::Prechecks, StepStatus::Success);
        attempt.finish(JobStatus::Failed);
        state.attempts.push(attempt);
        assert!(state.prechecks_passed());
    }

    #[test]
    fn work_summary_is_monoidal() {
        let mut total = WorkSummary::default();
        total.absorb(&WorkSummary {
            commits: 1,
            files_changed: 2,
            insertions: 10,
            deletions: 3,
        });
        total.absorb(&WorkSummary {
            commits: 2,
            files_changed: 1,
            insertions: 5,
            deletions: 0,
        });
        assert_eq!(total.commits, 3);
        assert_eq!(total.files_changed, 3);
        assert_eq!(total.insertions, 15);
        assert_eq!(total.deletions, 3);
    }

    #[test]
    fn job_state_serializes_spec_inline() {
        let spec = JobSpec {
            id: "j1".into(),
            runner_job_id: "r1".into(),
            name: "demo".into(),
            task: "demo task".into(),
            consumes_from: vec!["a".into()],
            inputs: JobInputs::default(),
            policy: JobPolicy::default(),
        };
        let state = JobState::new(spec);
        let value = serde_json::to_value(&state).unwrap();
        // The spec is flattened into the job entry, not nested.
        assert_eq!(value["runner_job_id"], "r1");
        assert_eq!(value["name"], "demo");
        assert_eq!(value["status"], "Queued");

        let back: JobState = serde_json::from_value(value).unwrap();
        assert_eq!(back.spec.id, "j1");
        assert_eq!(back.spec.consumes_from, vec!["a".to_string()]);
    }
}
