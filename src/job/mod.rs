//! Jobs: specs, runtime state, the phase pipeline, and the bounded runner.
//!
//! A job executes the fixed phase sequence
//! `preflight → [prechecks] → work → commit → [postchecks] → mergeback →
//! cleanup` inside its own worktree. The [`runner::JobRunner`] bounds how
//! many run at once and owns the only registry of live child processes;
//! [`monitor`] reattaches to those processes after a restart.

pub mod executor;
pub mod logfile;
pub mod monitor;
pub mod runner;
pub mod types;

pub use executor::ExecutorDeps;
pub use logfile::AttemptLog;
pub use runner::JobRunner;
pub use types::{
    parse_phase_command, Attempt, JobId, JobInputs, JobPolicy, JobSpec, JobState, JobStatus,
    Phase, PhaseCommand, StepStatus, WorkSummary,
};
