//! Application composition: wiring the scheduler stack together.
//!
//! The CLI (and integration tests) build a [`Runtime`] from a workspace
//! path; everything else is dependency-injected so tests can swap the
//! process runner and the agent delegator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::agent::{AgentDelegator, CliAgentDelegator};
use crate::config::Config;
use crate::events::ChangeBus;
use crate::git::GitService;
use crate::job::{ExecutorDeps, JobRunner};
use crate::merge::MergeCoordinator;
use crate::plan::{PlanRunner, PlanSnapshot, PlanSpec};
use crate::storage::{StateStore, JOBS_DEBOUNCE, PLANS_DEBOUNCE};
use crate::subprocess::SubprocessManager;

/// Initialize tracing for the binary. `RUST_LOG` wins over the verbosity
/// flag.
pub fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let default = match verbose {
        0 => "foreman=info",
        1 => "foreman=debug",
        _ => "foreman=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// The assembled scheduler stack.
pub struct Runtime {
    pub config: Config,
    pub subprocess: SubprocessManager,
    pub git: GitService,
    pub jobs: Arc<JobRunner>,
    pub plans: Arc<PlanRunner>,
    pub bus: Arc<ChangeBus>,
}

impl Runtime {
    /// Production wiring for a workspace directory.
    pub fn production(workspace: &Path) -> Result<Self> {
        let config = Config::load(workspace).context("loading configuration")?;
        let subprocess = SubprocessManager::production();
        let agent: Arc<dyn AgentDelegator> = Arc::new(CliAgentDelegator::new(
            subprocess.clone(),
            config.agent_cli.program.clone(),
        ));
        Self::assemble(workspace, config, subprocess, agent, default_log_root(workspace))
    }

    /// Wiring with injected collaborators (tests, embedding).
    pub fn with_parts(
        workspace: &Path,
        config: Config,
        subprocess: SubprocessManager,
        agent: Arc<dyn AgentDelegator>,
    ) -> Result<Self> {
        let log_root = workspace.join(".orchestrator").join("logs");
        Self::assemble(workspace, config, subprocess, agent, log_root)
    }

    fn assemble(
        workspace: &Path,
        config: Config,
        subprocess: SubprocessManager,
        agent: Arc<dyn AgentDelegator>,
        log_root: PathBuf,
    ) -> Result<Self> {
        let git = GitService::new(subprocess.clone());
        let merge = Arc::new(MergeCoordinator::new(
            git.clone(),
            Arc::clone(&agent),
            config.merge.clone(),
        ));
        let bus = Arc::new(ChangeBus::new());

        let jobs_store = StateStore::workspace_scoped(workspace, "jobs", JOBS_DEBOUNCE);
        let jobs = Arc::new(JobRunner::new(
            ExecutorDeps {
                subprocess: subprocess.clone(),
                git: git.clone(),
                agent: Arc::clone(&agent),
                merge: Arc::clone(&merge),
                config: config.clone(),
            },
            jobs_store,
            log_root,
            config.effective_parallelism(),
        ));

        let plans_store = StateStore::workspace_scoped(workspace, "plans", PLANS_DEBOUNCE);
        let plans = PlanRunner::new(
            git.clone(),
            agent,
            merge,
            Arc::clone(&jobs),
            plans_store,
            config.clone(),
            Arc::clone(&bus),
        );

        Ok(Self {
            config,
            subprocess,
            git,
            jobs,
            plans,
            bus,
        })
    }

    /// Restore persisted state. Jobs load (and reconcile orphans) before
    /// plans so plan polling observes settled job states.
    pub fn load(&self) -> Result<()> {
        self.jobs.load().context("loading job state")?;
        self.plans.load().context("loading plan state")?;
        Ok(())
    }

    /// Enqueue a plan and drive the pump until it settles.
    pub async fn run_plan_to_completion(&self, spec: PlanSpec) -> Result<PlanSnapshot> {
        let plan_id = self.plans.enqueue(spec)?;
        loop {
            self.plans.pump_all().await;
            if let Some(snapshot) = self.plans.get(&plan_id).await {
                if snapshot.state.status.is_terminal() {
                    return Ok(snapshot);
                }
            } else {
                anyhow::bail!("plan {plan_id} disappeared while running");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Sync flush of all persisted state (shutdown hook).
    pub async fn shutdown(&self) {
        if let Err(e) = self.jobs.shutdown_flush() {
            warn!("job state flush failed on shutdown: {e}");
        }
        if let Err(e) = self.plans.shutdown_flush().await {
            warn!("plan state flush failed on shutdown: {e}");
        }
    }
}

fn default_log_root(workspace: &Path) -> PathBuf {
    directories::ProjectDirs::from("", "", "foreman")
        .map(|dirs| dirs.data_local_dir().join("logs"))
        .unwrap_or_else(|| workspace.join(".orchestrator").join("logs"))
}
