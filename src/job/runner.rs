//! The bounded job runner.
//!
//! Owns the authoritative `JobId → JobState` map, a FIFO queue, and the
//! only registry of live child PIDs. `pump` dispatches queued jobs to the
//! phase executor while `working < max_concurrency`; terminal transitions
//! persist, notify, and pump again. On load, persisted Running jobs go
//! through orphan reconciliation before any state is exposed.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::executor::{ExecutorDeps, PersistHook, PhaseExecutor, SharedJob};
use super::logfile::{attempt_log_path, AttemptLog};
use super::monitor;
use super::types::{Attempt, JobId, JobSpec, JobState, JobStatus, Phase, StepStatus};
use crate::storage::{StateStore, StorageError};

/// On-disk shape of the runner's state file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JobsFile {
    pub jobs: Vec<JobState>,
}

pub struct JobRunner {
    shared: Arc<RunnerShared>,
}

pub(crate) struct RunnerShared {
    jobs: Mutex<HashMap<JobId, SharedJob>>,
    queue: Mutex<VecDeque<JobId>>,
    working: AtomicUsize,
    max_concurrency: usize,
    store: StateStore<JobsFile>,
    deps: ExecutorDeps,
    log_root: PathBuf,
    on_change: Mutex<Arc<dyn Fn() + Send + Sync>>,
}

impl JobRunner {
    pub fn new(
        deps: ExecutorDeps,
        store: StateStore<JobsFile>,
        log_root: PathBuf,
        max_concurrency: usize,
    ) -> Self {
        Self {
            shared: Arc::new(RunnerShared {
                jobs: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                working: AtomicUsize::new(0),
                max_concurrency: max_concurrency.max(1),
                store,
                deps,
                log_root,
                on_change: Mutex::new(Arc::new(|| {})),
            }),
        }
    }

    /// Hook fired after every persisted state transition (wired to the
    /// change bus and the plan pump poke).
    pub fn set_on_change(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.shared.on_change.lock().unwrap() = hook;
    }

    /// Load persisted jobs, migrating legacy schemas and reconciling
    /// orphans before anything is exposed.
    pub fn load(&self) -> Result<(), StorageError> {
        let log_root = self.shared.log_root.clone();
        let Some(file) = self
            .shared
            .store
            .load_migrated(|value| migrate_legacy_logs(value, &log_root))?
        else {
            return Ok(());
        };

        for mut state in file.jobs {
            let id = state.spec.runner_job_id.clone();
            let reconciliation = monitor::reconcile(&mut state);
            let was_queued = state.status == JobStatus::Queued;
            let job: SharedJob = Arc::new(Mutex::new(state));
            if let monitor::Reconciliation::Monitor(_) = reconciliation {
                let shared = Arc::clone(&self.shared);
                monitor::spawn_monitor(
                    Arc::clone(&job),
                    self.shared.deps.config.orphan.complete_as_success,
                    Arc::new(move || RunnerShared::after_change(&shared)),
                );
            }
            self.shared.jobs.lock().unwrap().insert(id.clone(), job);
            if was_queued {
                self.shared.queue.lock().unwrap().push_back(id);
            }
        }
        RunnerShared::persist(&self.shared);
        RunnerShared::pump(&self.shared);
        Ok(())
    }

    /// Admit a job; returns its runner id.
    pub fn submit(&self, mut spec: JobSpec) -> JobId {
        if spec.runner_job_id.is_empty() {
            spec.runner_job_id = Uuid::new_v4().to_string();
        }
        let id = spec.runner_job_id.clone();
        info!("submitting job {id} ({})", spec.name);
        let state = JobState::new(spec);
        self.shared
            .jobs
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::new(Mutex::new(state)));
        self.shared.queue.lock().unwrap().push_back(id.clone());
        RunnerShared::persist(&self.shared);
        RunnerShared::pump(&self.shared);
        id
    }

    /// Re-queue a terminal job for another attempt. Without explicit
    /// context, an instruction citing the prior attempt's log and failed
    /// phase is generated.
    pub fn retry(&self, id: &JobId, context: Option<String>) -> anyhow::Result<()> {
        let job = self
            .job(id)
            .ok_or_else(|| anyhow::anyhow!("unknown job: {id}"))?;
        {
            let mut state = job.lock().unwrap();
            if !state.status.is_terminal() {
                anyhow::bail!("job {id} is not in a terminal state");
            }
            let instruction = context.unwrap_or_else(|| auto_retry_context(&state));
            state.work_history.push(instruction);
            state.status = JobStatus::Queued;
            state.completed_commit = None;
            state.touch();
        }
        self.shared.queue.lock().unwrap().push_back(id.clone());
        RunnerShared::persist(&self.shared);
        RunnerShared::pump(&self.shared);
        Ok(())
    }

    /// Mark the job canceled and hard-kill every tracked PID, including
    /// ones reconstructed from persisted state after a restart.
    /// Termination is not awaited.
    pub fn cancel(&self, id: &JobId) {
        let Some(job) = self.job(id) else {
            return;
        };
        let pids = {
            let mut state = job.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }
            state.status = JobStatus::Canceled;
            state.touch();
            std::mem::take(&mut state.process_ids)
        };
        for pid in pids {
            info!("killing process {pid} for canceled job {id}");
            monitor::kill_pid(pid);
        }
        RunnerShared::persist(&self.shared);
        (self.shared.on_change.lock().unwrap().clone())();
    }

    /// Deep snapshot of one job.
    pub fn get(&self, id: &JobId) -> Option<JobState> {
        self.job(id).map(|job| job.lock().unwrap().clone())
    }

    /// Deep snapshot of all jobs.
    pub fn list(&self) -> Vec<JobState> {
        let jobs = self.shared.jobs.lock().unwrap();
        jobs.values().map(|job| job.lock().unwrap().clone()).collect()
    }

    pub fn pump(&self) {
        RunnerShared::pump(&self.shared);
    }

    /// Synchronous flush for shutdown.
    pub fn shutdown_flush(&self) -> Result<(), StorageError> {
        RunnerShared::snapshot_to_store(&self.shared);
        self.shared.store.flush_sync()
    }

    fn job(&self, id: &JobId) -> Option<SharedJob> {
        self.shared.jobs.lock().unwrap().get(id).cloned()
    }
}

impl RunnerShared {
    fn pump(shared: &Arc<RunnerShared>) {
        loop {
            if shared.working.load(Ordering::SeqCst) >= shared.max_concurrency {
                return;
            }
            let Some(id) = shared.queue.lock().unwrap().pop_front() else {
                return;
            };
            let Some(job) = shared.jobs.lock().unwrap().get(&id).cloned() else {
                continue;
            };

            let log = {
                let mut state = job.lock().unwrap();
                if state.status != JobStatus::Queued {
                    // Canceled while waiting in the queue.
                    continue;
                }
                state.status = JobStatus::Running;
                match open_attempt(&mut state, &shared.log_root) {
                    Ok(log) => log,
                    Err(e) => {
                        warn!("job {id}: could not open attempt log: {e}");
                        state.status = JobStatus::Failed;
                        state.touch();
                        continue;
                    }
                }
            };

            shared.working.fetch_add(1, Ordering::SeqCst);
            Self::persist(shared);

            let task_shared = Arc::clone(shared);
            tokio::spawn(async move {
                let persist: PersistHook = {
                    let shared = Arc::clone(&task_shared);
                    Arc::new(move || RunnerShared::persist(&shared))
                };
                let executor = PhaseExecutor::new(task_shared.deps.clone(), persist);
                executor.run(job, log).await;

                task_shared.working.fetch_sub(1, Ordering::SeqCst);
                RunnerShared::after_change(&task_shared);
                RunnerShared::pump(&task_shared);
            });
        }
    }

    fn persist(shared: &Arc<RunnerShared>) {
        Self::snapshot_to_store(shared);
    }

    fn snapshot_to_store(shared: &Arc<RunnerShared>) {
        let jobs = {
            let map = shared.jobs.lock().unwrap();
            map.values().map(|job| job.lock().unwrap().clone()).collect()
        };
        shared.store.schedule_save(JobsFile { jobs });
    }

    fn after_change(shared: &Arc<RunnerShared>) {
        Self::persist(shared);
        (shared.on_change.lock().unwrap().clone())();
    }
}

/// Open a fresh attempt on `state`: new log file, prechecks carried over
/// from a prior passing attempt, work/postchecks cleared for re-evaluation.
fn open_attempt(state: &mut JobState, log_root: &std::path::Path) -> std::io::Result<AttemptLog> {
    let attempt_id = Uuid::new_v4().to_string();
    let path = attempt_log_path(log_root, &state.spec.runner_job_id, &attempt_id);
    let mut attempt = Attempt::new(attempt_id.clone(), path.clone());
    attempt.work_instruction = state.latest_instruction().map(str::to_string);
    if state.prechecks_passed() {
        attempt.set_step(Phase::Prechecks, StepStatus::Skipped);
    }

    state.step_statuses.remove(Phase::Work.as_str());
    state.step_statuses.remove(Phase::Postchecks.as_str());
    state.current_attempt_id = Some(attempt_id);
    state.log_file = Some(path.clone());
    state.attempts.push(attempt);
    state.touch();

    AttemptLog::create(path)
}

/// Instruction generated when a retry is requested without context.
fn auto_retry_context(state: &JobState) -> String {
    let last = state.attempts.last();
    let failed_phase = last
        .map(|attempt| {
            Phase::SEQUENCE
                .iter()
                .find(|phase| attempt.step(**phase) == StepStatus::Failed)
                .map(|phase| phase.as_str())
                .unwrap_or("work")
        })
        .unwrap_or("work");
    let log = last
        .map(|attempt| attempt.log_file.display().to_string())
        .unwrap_or_else(|| "<no log>".to_string());

    let mut context = format!(
        "The previous attempt failed during the {failed_phase} phase. \
         Review the log at {log} for the root cause."
    );
    if let Some(instruction) = state.latest_instruction() {
        context.push_str(&format!(" Prior instruction: {instruction}."));
    }
    context.push_str(" Address the failure and complete the original task.");
    context
}

/// Legacy schema shim: jobs that persisted an in-memory `log` array get it
/// rewritten to a log file on disk.
fn migrate_legacy_logs(value: &mut serde_json::Value, log_root: &std::path::Path) {
    let Some(jobs) = value.get_mut("jobs").and_then(|j| j.as_array_mut()) else {
        return;
    };
    for entry in jobs {
        let Some(lines) = entry.get("log").and_then(|l| l.as_array()) else {
            continue;
        };
        let id = entry
            .get("runner_job_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let contents: String = lines
            .iter()
            .filter_map(|l| l.as_str())
            .map(|l| format!("{l}\n"))
            .collect();
        let path = log_root.join(format!("{id}-legacy.log"));
        if std::fs::create_dir_all(log_root).is_ok() && std::fs::write(&path, contents).is_ok() {
            let map = entry.as_object_mut().unwrap();
            map.remove("log");
            map.insert(
                "log_file".to_string(),
                serde_json::Value::String(path.display().to_string()),
            );
        }
    }
}
