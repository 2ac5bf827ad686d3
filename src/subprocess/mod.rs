//! Subprocess abstraction layer for external tool integration
//!
//! Everything foreman runs out-of-process (git, the agent CLI, user phase
//! commands) goes through the [`ProcessRunner`] trait so that scheduling
//! code never touches `tokio::process` directly and tests can substitute a
//! deterministic mock.
//!
//! Two execution shapes are supported:
//! - [`ProcessRunner::run`] for short-lived commands whose full output is
//!   wanted at once (git plumbing, probes);
//! - [`ProcessRunner::spawn`] for tracked children: the caller gets the PID
//!   immediately (for the scheduler's process registry and kill paths) plus
//!   a line stream for the attempt log.

pub mod builder;
pub mod error;
pub mod mock;
pub mod runner;

#[cfg(test)]
mod tests;

pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use mock::MockProcessRunner;
pub use runner::{
    ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, SpawnedProcess, TokioProcessRunner,
};

use std::sync::Arc;

/// Central handle for subprocess execution.
///
/// Holds the injected [`ProcessRunner`]; clones share the same runner.
#[derive(Clone)]
pub struct SubprocessManager {
    runner: Arc<dyn ProcessRunner>,
}

impl SubprocessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Production manager backed by the Tokio process runner.
    pub fn production() -> Self {
        Self::new(Arc::new(TokioProcessRunner))
    }

    /// Mock manager for tests; returns the mock so expectations can be
    /// configured.
    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let runner = Arc::new(mock.clone()) as Arc<dyn ProcessRunner>;
        (Self::new(runner), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }
}
