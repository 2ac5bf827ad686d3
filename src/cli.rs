//! Command-line surface: a thin layer over [`crate::app::Runtime`].

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::app::Runtime;
use crate::plan::{PlanSnapshot, PlanSpec};

#[derive(Parser)]
#[command(name = "foreman", about = "Schedule DAGs of agent coding jobs across git worktrees")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Workspace directory (defaults to the current directory).
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a plan file (YAML or JSON) to completion.
    Run {
        /// Path to the plan spec.
        plan: PathBuf,
    },
    /// Show all known plans and jobs.
    Status,
    /// Cancel a running plan.
    Cancel { plan_id: String },
    /// Cancel a plan and reclaim everything it owns.
    Delete { plan_id: String },
}

pub async fn execute(cli: Cli) -> Result<()> {
    let workspace = match cli.workspace {
        Some(workspace) => workspace,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let runtime = Runtime::production(&workspace)?;
    runtime.load()?;

    match cli.command {
        Command::Run { plan } => {
            let spec = read_plan_spec(&plan)?;
            let snapshot = runtime.run_plan_to_completion(spec).await?;
            print_plan(&snapshot);
            runtime.shutdown().await;
            if !matches!(
                snapshot.state.status,
                crate::plan::PlanStatus::Succeeded
            ) {
                anyhow::bail!("plan finished as {:?}", snapshot.state.status);
            }
        }
        Command::Status => {
            for snapshot in runtime.plans.list().await.iter() {
                print_plan(snapshot);
            }
            for job in runtime.jobs.list() {
                println!(
                    "job {} [{}] {:?} {}",
                    job.spec.runner_job_id,
                    job.spec.name,
                    job.status,
                    job.completed_commit.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Cancel { plan_id } => {
            runtime.plans.cancel(&plan_id).await;
            runtime.shutdown().await;
        }
        Command::Delete { plan_id } => {
            runtime.plans.delete(&plan_id).await;
            runtime.shutdown().await;
        }
    }
    Ok(())
}

fn read_plan_spec(path: &PathBuf) -> Result<PlanSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan file {}", path.display()))?;
    let spec = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&raw).context("parsing plan JSON")?
    } else {
        serde_yaml::from_str(&raw).context("parsing plan YAML")?
    };
    Ok(spec)
}

fn print_plan(snapshot: &PlanSnapshot) {
    let state = &snapshot.state;
    println!(
        "plan {} [{}] {:?} done={} failed={} merged={} cleaned={}",
        snapshot.id,
        snapshot.name,
        state.status,
        state.done.len(),
        state.failed.len(),
        state.merged_leaves.len(),
        state.cleaned_work_units.len(),
    );
    if let Some(summary) = &state.work_summary {
        println!(
            "  {} commit(s), {} file(s) changed, +{} -{}",
            summary.commits, summary.files_changed, summary.insertions, summary.deletions
        );
    }
    for error in &state.errors {
        println!("  error: {error}");
    }
}
