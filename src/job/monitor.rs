//! PID probing, cancellation kills, and post-restart orphan monitoring.
//!
//! After a restart the scheduler has persisted PID sets but no process
//! handles. Each persisted Running job is probed: if every PID is gone the
//! job failed while we were away; if any survive, a passive monitor polls
//! them until the last one exits. Exit codes are unknowable at that point,
//! so the terminal status is best-effort and configurable.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::types::{JobState, JobStatus, StepStatus};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// A monitored process with no observable activity for this long is
/// considered hung.
pub const HUNG_AFTER: Duration = Duration::from_secs(10 * 60);
/// Warning cadence once the hung threshold is crossed.
pub const WARN_EVERY: Duration = Duration::from_secs(5 * 60);

/// Signal-0 probe on POSIX; process-table query elsewhere.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(windows)]
    {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        false
    }
}

/// Hard kill: SIGKILL to the process group (falling back to the process) on
/// POSIX, `taskkill /F /T` elsewhere. Termination is not awaited; the next
/// pump observes the exit.
pub fn kill_pid(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        // Children are spawned in their own process group; killing the
        // group reaches grandchildren too.
        if kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL).is_err() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output();
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
    }
}

/// What orphan reconciliation decided for one persisted job.
#[derive(Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// Job was not Running or tracked no PIDs; nothing to do.
    NotRunning,
    /// Every PID is gone: the job was marked Failed with an orphaned
    /// attempt.
    Orphaned,
    /// These PIDs survive; attach a passive monitor.
    Monitor(Vec<u32>),
}

/// Probe a persisted job's PID set and update its state accordingly.
/// Runs before any user-visible state is exposed after a restart.
pub fn reconcile(job: &mut JobState) -> Reconciliation {
    if job.status != JobStatus::Running || job.process_ids.is_empty() {
        if job.status == JobStatus::Running {
            // Running with no PIDs recorded: the process never spawned or
            // exited before persist; treat as orphaned all the same.
            mark_orphaned(job);
            return Reconciliation::Orphaned;
        }
        return Reconciliation::NotRunning;
    }

    let live: Vec<u32> = job
        .process_ids
        .iter()
        .copied()
        .filter(|pid| pid_alive(*pid))
        .collect();

    if live.is_empty() {
        mark_orphaned(job);
        return Reconciliation::Orphaned;
    }

    info!(
        "job {} survived restart with {} live process(es)",
        job.spec.runner_job_id,
        live.len()
    );
    job.process_ids = live.clone();
    job.touch();
    Reconciliation::Monitor(live)
}

fn mark_orphaned(job: &mut JobState) {
    warn!(
        "job {} was running at shutdown and its processes are gone; marking failed",
        job.spec.runner_job_id
    );
    job.status = JobStatus::Failed;
    job.process_ids.clear();
    if let Some(phase) = job.current_phase {
        job.record_step(phase, StepStatus::Failed);
    }
    if let Some(attempt) = job.current_attempt_mut() {
        attempt.failure_reason = Some("orphaned: all tracked processes exited while the scheduler was down".to_string());
        attempt.finish(JobStatus::Failed);
    }
    job.touch();
}

/// Passive monitor for a restart-recovered job: poll the surviving PIDs,
/// warn when they look hung, and settle the job when the last one exits.
pub fn spawn_monitor(
    job: Arc<Mutex<JobState>>,
    complete_as_success: bool,
    on_change: Arc<dyn Fn() + Send + Sync>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_activity = Instant::now();
        let mut last_warn: Option<Instant> = None;

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let (job_id, mut pids, status) = {
                let state = job.lock().unwrap();
                (
                    state.spec.runner_job_id.clone(),
                    state.process_ids.clone(),
                    state.status,
                )
            };
            if status != JobStatus::Running {
                return;
            }

            let before = pids.len();
            pids.retain(|pid| pid_alive(*pid));
            if pids.len() != before {
                last_activity = Instant::now();
                last_warn = None;
            }

            if pids.is_empty() {
                let outcome = if complete_as_success {
                    JobStatus::Succeeded
                } else {
                    JobStatus::Failed
                };
                info!("job {job_id}: last monitored process exited; marking {outcome:?} (best-effort, exit codes unknown after restart)");
                let mut state = job.lock().unwrap();
                state.status = outcome;
                state.process_ids.clear();
                if let Some(attempt) = state.current_attempt_mut() {
                    attempt.finish(outcome);
                }
                state.touch();
                drop(state);
                on_change();
                return;
            }

            {
                let mut state = job.lock().unwrap();
                if state.process_ids != pids {
                    state.process_ids = pids.clone();
                    state.touch();
                    drop(state);
                    on_change();
                }
            }

            if last_activity.elapsed() > HUNG_AFTER
                && last_warn.map_or(true, |at| at.elapsed() > WARN_EVERY)
            {
                warn!(
                    "job {job_id}: monitored process(es) {pids:?} silent for {} minutes",
                    last_activity.elapsed().as_secs() / 60
                );
                last_warn = Some(Instant::now());
            }
        }
    })
}
