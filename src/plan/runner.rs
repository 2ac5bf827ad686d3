//! The plan runner: DAG admission, the pump cycle, worktree provisioning
//! with base-branch chaining, leaf merges, sub-plan launches, and
//! completion.
//!
//! One cooperative pump task drives every plan. A reentry guard keeps pump
//! cycles mutually exclusive; a notifier lets state changes poke the pump
//! between ticks. Worktree provisioning runs as detached tasks whose
//! handles are probed without blocking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cleanup;
use super::spec::{AdmissionError, DagIndex, PlanSpec};
use super::state::{PlanState, PlanStatus, UnitBucket};
use crate::agent::{AgentDelegator, AgentRequest};
use crate::config::Config;
use crate::events::ChangeBus;
use crate::git::{GitService, MergeOutcome};
use crate::job::{JobInputs, JobRunner, JobSpec, JobStatus, WorkSummary};
use crate::merge::{MergeCoordinator, MergeRequest};
use crate::storage::{StateStore, StorageError};

/// Ticker period for the pump loop.
pub const PUMP_TICK: Duration = Duration::from_millis(1500);

/// On-disk shape of the plan runner's state file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PlansFile {
    pub items: Vec<PlanRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    pub spec: PlanSpec,
    pub state: PlanState,
    #[serde(default)]
    pub is_sub_plan: bool,
    /// (parent plan id, plan-local sub-plan id) when nested.
    #[serde(default)]
    pub parent: Option<(String, String)>,
}

/// Deep, immutable public view of one plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSnapshot {
    pub id: String,
    pub name: String,
    pub is_sub_plan: bool,
    pub state: PlanState,
}

struct Provisioned {
    worktree_path: PathBuf,
    base_commit: String,
}

struct PlanEntry {
    spec: PlanSpec,
    state: PlanState,
    dag: DagIndex,
    is_sub_plan: bool,
    parent: Option<(String, String)>,
    /// In-flight worktree creation per plan-local job id. Runtime only.
    provisioning: HashMap<String, JoinHandle<Result<Provisioned, String>>>,
}

type EntryRef = Arc<AsyncMutex<PlanEntry>>;

pub struct PlanRunner {
    inner: Arc<Inner>,
}

struct Inner {
    plans: StdMutex<HashMap<String, EntryRef>>,
    /// Admission order, parents before the children they launch.
    order: StdMutex<Vec<String>>,
    store: StateStore<PlansFile>,
    git: GitService,
    agent: Arc<dyn AgentDelegator>,
    merge: Arc<MergeCoordinator>,
    jobs: Arc<JobRunner>,
    config: Config,
    bus: Arc<ChangeBus>,
    pumping: AtomicBool,
    poke: Notify,
    snapshot_cache: StdMutex<Option<Arc<Vec<PlanSnapshot>>>>,
}

impl PlanRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        git: GitService,
        agent: Arc<dyn AgentDelegator>,
        merge: Arc<MergeCoordinator>,
        jobs: Arc<JobRunner>,
        store: StateStore<PlansFile>,
        config: Config,
        bus: Arc<ChangeBus>,
    ) -> Arc<Self> {
        let runner = Arc::new(Self {
            inner: Arc::new(Inner {
                plans: StdMutex::new(HashMap::new()),
                order: StdMutex::new(Vec::new()),
                store,
                git,
                agent,
                merge,
                jobs,
                config,
                bus,
                pumping: AtomicBool::new(false),
                poke: Notify::new(),
                snapshot_cache: StdMutex::new(None),
            }),
        });
        // Job-runner transitions poke the pump so completions are observed
        // without waiting for the next tick.
        let weak = Arc::downgrade(&runner);
        runner.inner.jobs.set_on_change(Arc::new(move || {
            if let Some(runner) = weak.upgrade() {
                runner.poke();
            }
        }));
        runner
    }

    pub fn bus(&self) -> Arc<ChangeBus> {
        Arc::clone(&self.inner.bus)
    }

    /// Wake the pump loop ahead of its ticker.
    pub fn poke(&self) {
        self.inner.poke.notify_one();
    }

    /// Spawn the cooperative pump loop: tick or poke, then one pump cycle.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = runner.inner.poke.notified() => {}
                    _ = tokio::time::sleep(PUMP_TICK) => {}
                }
                runner.pump_all().await;
            }
        })
    }

    /// Admit a plan. Root jobs start queued; nothing touches the repository
    /// until the first pump.
    pub fn enqueue(&self, spec: PlanSpec) -> Result<String, AdmissionError> {
        let id = self.admit(spec, false, None)?;
        info!("plan {id} admitted");
        self.poke();
        Ok(id)
    }

    fn admit(
        &self,
        spec: PlanSpec,
        is_sub_plan: bool,
        parent: Option<(String, String)>,
    ) -> Result<String, AdmissionError> {
        let spec = spec.normalized();
        let dag = DagIndex::build(&spec)?;
        let plan_id = spec.id.clone();

        let mut state = PlanState::new();
        for job in &spec.jobs {
            state
                .job_id_map
                .insert(job.id.clone(), Uuid::new_v4().to_string());
        }
        for root in dag.roots() {
            if dag.is_job(dag.index_of(root).expect("root is indexed")) {
                state.transition(root, UnitBucket::Queued);
            }
        }
        for sub in &spec.sub_plans {
            state.pending_sub_plans.insert(sub.id.clone());
        }

        let entry = PlanEntry {
            spec,
            state,
            dag,
            is_sub_plan,
            parent,
            provisioning: HashMap::new(),
        };
        self.inner
            .plans
            .lock()
            .unwrap()
            .insert(plan_id.clone(), Arc::new(AsyncMutex::new(entry)));
        self.inner.order.lock().unwrap().push(plan_id.clone());
        Ok(plan_id)
    }

    /// One pump cycle over every live plan. Reentry-guarded: overlapping
    /// calls return immediately.
    pub async fn pump_all(&self) {
        if self.inner.pumping.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<String> = self.inner.order.lock().unwrap().clone();
        for id in ids {
            let Some(entry_ref) = self.entry(&id) else {
                continue;
            };
            let mut entry = entry_ref.lock().await;
            if entry.state.status.is_terminal() {
                continue;
            }
            if let Err(e) = self.pump_plan(&mut entry).await {
                // Programmer errors and unexpected git failures are caught
                // at the pump frame; the plan resumes at the next tick.
                warn!("pump of plan {id} errored: {e:#}");
                entry.state.record_error(format!("{e:#}"));
            }
        }
        self.persist_and_publish().await;
        self.inner.pumping.store(false, Ordering::SeqCst);
    }

    async fn pump_plan(&self, entry: &mut PlanEntry) -> anyhow::Result<()> {
        if entry.state.status == PlanStatus::Queued {
            entry.state.status = PlanStatus::Running;
            entry.state.touch();
        }
        if !self.resolve_target_root(entry).await {
            return Ok(());
        }
        self.check_preparing(entry).await;
        self.admit_new_work(entry).await;
        self.poll_running_jobs(entry).await;
        self.poll_sub_plans(entry).await;
        self.check_completion(entry).await;
        Ok(())
    }

    /// Lazy target-branch-root resolution on the first pump. On a default
    /// base branch the plan forks its own feature branch; otherwise it
    /// adopts the base branch. Returns false when the plan cannot proceed.
    async fn resolve_target_root(&self, entry: &mut PlanEntry) -> bool {
        if entry.state.target_branch_root.is_some() {
            return true;
        }
        let repo = entry.spec.repo_path.clone();
        let base = entry.spec.base_branch().to_string();

        let default = match self.inner.git.default_branch(&repo).await {
            Ok(default) => default,
            Err(e) => {
                entry
                    .state
                    .record_error(format!("cannot resolve default branch: {e}"));
                entry.state.status = PlanStatus::Failed;
                return false;
            }
        };

        let result = if base == default {
            let branch = format!("copilot_jobs/{}", entry.spec.id);
            let exists = self.inner.git.branch_exists(&repo, &branch).await;
            let created = if exists {
                Ok(())
            } else {
                self.inner.git.create_branch(&repo, &branch, &base).await
            };
            created.map(|_| (branch, true))
        } else {
            // Non-default base: deliver directly onto the user's branch.
            self.inner
                .git
                .resolve_ref(&repo, &base)
                .await
                .map(|_| (base, false))
        };

        match result {
            Ok((root, created)) => {
                info!(
                    "plan {}: target branch root is {root} (created: {created})",
                    entry.spec.id
                );
                entry.state.target_branch_root = Some(root);
                entry.state.target_branch_root_created = created;
                entry.state.touch();
                true
            }
            Err(e) => {
                entry
                    .state
                    .record_error(format!("cannot establish target branch root: {e}"));
                entry.state.status = PlanStatus::Failed;
                false
            }
        }
    }

    /// Probe provisioning futures without blocking; settled jobs are
    /// submitted to the job runner (Ok) or failed (Err).
    async fn check_preparing(&self, entry: &mut PlanEntry) {
        let settled: Vec<String> = entry
            .provisioning
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for id in settled {
            let handle = entry.provisioning.remove(&id).expect("settled handle");
            match handle.await {
                Ok(Ok(provisioned)) => {
                    entry
                        .state
                        .base_commits
                        .insert(id.clone(), provisioned.base_commit);
                    entry
                        .state
                        .worktree_paths
                        .insert(id.clone(), provisioned.worktree_path.clone());
                    self.submit_job(entry, &id, provisioned.worktree_path);
                }
                Ok(Err(reason)) => {
                    warn!("provisioning of {id} failed: {reason}");
                    entry
                        .state
                        .record_error(format!("worktree provisioning for {id} failed: {reason}"));
                    entry.state.transition(&id, UnitBucket::Failed);
                }
                Err(join_error) => {
                    entry.state.record_error(format!(
                        "worktree provisioning for {id} aborted: {join_error}"
                    ));
                    entry.state.transition(&id, UnitBucket::Failed);
                }
            }
        }
    }

    fn submit_job(&self, entry: &mut PlanEntry, id: &str, worktree_path: PathBuf) {
        let Some(job) = entry.spec.jobs.iter().find(|j| j.id == id) else {
            entry
                .state
                .record_error(format!("no job spec for prepared unit {id}"));
            entry.state.transition(id, UnitBucket::Failed);
            return;
        };
        let runner_job_id = entry
            .state
            .job_id_map
            .get(id)
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let spec = JobSpec {
            id: id.to_string(),
            runner_job_id,
            name: job.display_name().to_string(),
            task: job.task.clone(),
            consumes_from: job.consumes_from.clone(),
            inputs: JobInputs {
                base_branch: None,
                target_branch: None,
                worktree_root: Some(entry.spec.worktree_root().to_string()),
                additional_instructions: job.additional_instructions.clone(),
                is_plan_managed: true,
                worktree_path: Some(worktree_path),
            },
            policy: job.policy.clone(),
        };
        self.inner.jobs.submit(spec);
        entry.state.submitted.insert(id.to_string());
        entry.state.transition(id, UnitBucket::Running);
    }

    /// Queue newly-ready jobs, start provisioning under the parallelism
    /// bound, and launch sub-plans whose producers are satisfied.
    async fn admit_new_work(&self, entry: &mut PlanEntry) {
        self.scan_ready_jobs(entry);

        let max = if entry.spec.max_parallel > 0 {
            entry.spec.max_parallel
        } else {
            self.inner.config.effective_parallelism()
        };

        while entry.state.running.len() + entry.state.preparing.len() < max {
            let Some(id) = entry.state.queued.iter().next().cloned() else {
                break;
            };
            entry.state.transition(&id, UnitBucket::Preparing);
            match self.source_refs(entry, &id) {
                Ok(sources) => {
                    let handle = self.spawn_provisioning(entry, &id, sources);
                    entry.provisioning.insert(id, handle);
                }
                Err(reason) => {
                    entry.state.record_error(reason);
                    entry.state.transition(&id, UnitBucket::Failed);
                }
            }
        }

        let ready_subs: Vec<String> = entry
            .state
            .pending_sub_plans
            .iter()
            .filter(|sub| {
                entry
                    .dag
                    .producers_of(sub)
                    .iter()
                    .all(|producer| entry.state.producer_satisfied(producer))
            })
            .cloned()
            .collect();
        for sub in ready_subs {
            self.launch_sub_plan(entry, &sub).await;
        }
    }

    /// Any job in no bucket whose producers have all delivered becomes
    /// queued.
    fn scan_ready_jobs(&self, entry: &mut PlanEntry) {
        let ready: Vec<String> = entry
            .dag
            .all_ids()
            .filter(|id| {
                entry.dag.index_of(id).map(|i| entry.dag.is_job(i)) == Some(true)
                    && !in_any_bucket(&entry.state, id)
                    && !entry.dag.producers_of(id).is_empty()
                    && entry
                        .dag
                        .producers_of(id)
                        .iter()
                        .all(|producer| entry.state.producer_satisfied(producer))
            })
            .map(str::to_string)
            .collect();
        for id in ready {
            debug!("job {id} is ready");
            entry.state.transition(&id, UnitBucket::Queued);
        }
    }

    /// Source refs for a job's worktree: the target branch root for roots,
    /// otherwise the producers' completed commits (first is the base, the
    /// rest are merged in after creation).
    fn source_refs(&self, entry: &PlanEntry, id: &str) -> Result<Vec<String>, String> {
        let producers = entry.dag.producers_of(id);
        if producers.is_empty() {
            return entry
                .state
                .target_branch_root
                .clone()
                .map(|root| vec![root])
                .ok_or_else(|| "target branch root not resolved".to_string());
        }
        producers
            .iter()
            .map(|producer| {
                entry
                    .state
                    .completed_commits
                    .get(*producer)
                    .cloned()
                    .ok_or_else(|| format!("producer {producer} of {id} has no completed commit"))
            })
            .collect()
    }

    /// Async worktree creation; the pump probes the handle on later cycles.
    fn spawn_provisioning(
        &self,
        entry: &PlanEntry,
        id: &str,
        sources: Vec<String>,
    ) -> JoinHandle<Result<Provisioned, String>> {
        let git = self.inner.git.clone();
        let agent = Arc::clone(&self.inner.agent);
        let prefer = self.inner.config.merge.prefer;
        let repo = entry.spec.repo_path.clone();
        let runner_job_id = entry
            .state
            .job_id_map
            .get(id)
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let worktree = repo.join(entry.spec.worktree_root()).join(&runner_job_id);
        let branch = format!("copilot_jobs/{}/{}", entry.spec.id, runner_job_id);
        let unit = id.to_string();

        tokio::spawn(async move {
            let base = sources.first().cloned().ok_or("no source ref")?;
            git.create_worktree(&repo, &worktree, Some(&branch), &base)
                .await
                .map_err(|e| format!("worktree create failed: {e}"))?;
            let base_commit = git
                .resolve_ref(&repo, &base)
                .await
                .map_err(|e| format!("cannot resolve base ref {base}: {e}"))?;

            for extra in &sources[1..] {
                let message = format!("Merge upstream work {extra} into {unit}");
                match git.merge(&worktree, extra, &message, false).await {
                    Ok(MergeOutcome::Clean) => {}
                    Ok(MergeOutcome::Conflicts { files }) => {
                        let task = format!(
                            "Resolve the merge conflicts from merging {extra} into this \
                             worktree. Conflicted files: {}. Prefer the {} side where both \
                             changed. Stage the resolutions and complete the merge with the \
                             commit message: {message}",
                            files.join(", "),
                            prefer.as_str(),
                        );
                        let outcome = agent.delegate(AgentRequest::new(task, worktree.clone())).await;
                        if !outcome.success {
                            let _ = git.abort_merge(&worktree).await;
                            return Err(format!(
                                "agent could not resolve producer merge conflicts: {}",
                                outcome.error.unwrap_or_default()
                            ));
                        }
                        let unmerged = git
                            .unmerged_files(&worktree)
                            .await
                            .map_err(|e| e.to_string())?;
                        if !unmerged.is_empty() {
                            let _ = git.abort_merge(&worktree).await;
                            return Err(format!("conflicts remain in {unmerged:?}"));
                        }
                        if git
                            .has_staged_changes(&worktree)
                            .await
                            .map_err(|e| e.to_string())?
                        {
                            git.commit(&worktree, &message)
                                .await
                                .map_err(|e| e.to_string())?;
                        }
                    }
                    Err(e) => return Err(format!("producer merge failed: {e}")),
                }
            }

            Ok(Provisioned {
                worktree_path: worktree,
                base_commit,
            })
        })
    }

    async fn poll_running_jobs(&self, entry: &mut PlanEntry) {
        let running: Vec<String> = entry.state.running.iter().cloned().collect();
        for id in running {
            let Some(runner_job_id) = entry.state.job_id_map.get(&id).cloned() else {
                continue;
            };
            let Some(job) = self.inner.jobs.get(&runner_job_id) else {
                entry
                    .state
                    .record_error(format!("job {id} vanished from the job runner"));
                entry.state.transition(&id, UnitBucket::Failed);
                continue;
            };
            match job.status {
                JobStatus::Succeeded => {
                    entry.state.transition(&id, UnitBucket::Done);
                    match job.completed_commit {
                        Some(commit) => {
                            entry.state.completed_commits.insert(id.clone(), commit);
                        }
                        None => {
                            entry.state.record_error(format!(
                                "job {id} succeeded without a completed commit"
                            ));
                            entry.state.transition(&id, UnitBucket::Failed);
                            continue;
                        }
                    }
                    if entry.dag.is_leaf(&id) {
                        self.merge_leaf(entry, &id).await;
                    }
                    self.scan_ready_jobs(entry);
                }
                JobStatus::Failed => {
                    entry.state.transition(&id, UnitBucket::Failed);
                }
                JobStatus::Canceled => {
                    entry.state.transition(&id, UnitBucket::Canceled);
                }
                _ => {}
            }
        }
    }

    async fn poll_sub_plans(&self, entry: &mut PlanEntry) {
        let running: Vec<String> = entry.state.running_sub_plans.iter().cloned().collect();
        for sub_id in running {
            let Some(child_plan_id) = entry.state.sub_plan_ids.get(&sub_id).cloned() else {
                continue;
            };
            let Some(child_ref) = self.entry(&child_plan_id) else {
                entry
                    .state
                    .record_error(format!("child plan for {sub_id} vanished"));
                entry.state.running_sub_plans.remove(&sub_id);
                entry.state.failed_sub_plans.insert(sub_id);
                continue;
            };
            let (child_status, child_summary) = {
                let child = child_ref.lock().await;
                (child.state.status, child.state.work_summary)
            };
            match child_status {
                PlanStatus::Succeeded => {
                    entry.state.running_sub_plans.remove(&sub_id);
                    entry.state.completed_sub_plans.insert(sub_id.clone());
                    let Some(branch) = entry.state.integration_branches.get(&sub_id).cloned()
                    else {
                        entry
                            .state
                            .record_error(format!("no integration branch for {sub_id}"));
                        continue;
                    };
                    match self.inner.git.resolve_ref(&entry.spec.repo_path, &branch).await {
                        Ok(commit) => {
                            entry.state.completed_commits.insert(sub_id.clone(), commit);
                        }
                        Err(e) => {
                            entry.state.record_error(format!(
                                "cannot resolve integration branch {branch}: {e}"
                            ));
                        }
                    }
                    if let Some(summary) = child_summary {
                        entry.state.absorb_summary(&summary);
                    }
                    if entry.dag.is_leaf(&sub_id) {
                        self.merge_leaf(entry, &sub_id).await;
                    }
                    self.scan_ready_jobs(entry);
                }
                PlanStatus::Failed | PlanStatus::Canceled | PlanStatus::Partial => {
                    entry.state.running_sub_plans.remove(&sub_id);
                    entry.state.failed_sub_plans.insert(sub_id);
                    entry.state.touch();
                }
                _ => {}
            }
        }
    }

    /// Launch a nested plan onto its own integration branch, worktree root
    /// nested under the parent's.
    async fn launch_sub_plan(&self, entry: &mut PlanEntry, sub_id: &str) {
        let Some(sub) = entry.spec.sub_plans.iter().find(|s| s.id == sub_id).cloned() else {
            entry
                .state
                .record_error(format!("no sub-plan spec for {sub_id}"));
            entry.state.pending_sub_plans.remove(sub_id);
            entry.state.failed_sub_plans.insert(sub_id.to_string());
            return;
        };
        let repo = entry.spec.repo_path.clone();
        let producers = entry.dag.producers_of(sub_id);
        let source = if producers.is_empty() {
            entry.state.target_branch_root.clone()
        } else {
            entry.state.completed_commits.get(producers[0]).cloned()
        };
        let Some(source) = source else {
            entry
                .state
                .record_error(format!("no source ref for sub-plan {sub_id}"));
            entry.state.pending_sub_plans.remove(sub_id);
            entry.state.failed_sub_plans.insert(sub_id.to_string());
            return;
        };

        let branch = format!("copilot_jobs/{}/integration/{sub_id}", entry.spec.id);
        if !self.inner.git.branch_exists(&repo, &branch).await {
            if let Err(e) = self.inner.git.create_branch(&repo, &branch, &source).await {
                entry
                    .state
                    .record_error(format!("cannot create integration branch {branch}: {e}"));
                entry.state.pending_sub_plans.remove(sub_id);
                entry.state.failed_sub_plans.insert(sub_id.to_string());
                return;
            }
        }
        let base_commit = match self.inner.git.resolve_ref(&repo, &branch).await {
            Ok(sha) => sha,
            Err(e) => {
                entry
                    .state
                    .record_error(format!("cannot resolve {branch}: {e}"));
                entry.state.pending_sub_plans.remove(sub_id);
                entry.state.failed_sub_plans.insert(sub_id.to_string());
                return;
            }
        };

        // Remaining producers fold into the integration branch up front so
        // the child observes all upstream work.
        for extra in producers.iter().skip(1) {
            let Some(commit) = entry.state.completed_commits.get(*extra).cloned() else {
                continue;
            };
            let request = MergeRequest {
                repo: repo.clone(),
                source_commit: commit,
                target_branch: branch.clone(),
                work_unit: format!("{extra} (into sub-plan {sub_id})"),
                message: None,
            };
            if let Err(failure) = self.inner.merge.merge_to_target(&request).await {
                entry.state.record_error(format!(
                    "cannot integrate producer {extra} for sub-plan {sub_id}: {failure}"
                ));
                entry.state.pending_sub_plans.remove(sub_id);
                entry.state.failed_sub_plans.insert(sub_id.to_string());
                return;
            }
        }

        let mut child_spec = sub.plan.clone();
        child_spec.id = Uuid::new_v4().to_string();
        child_spec.repo_path = repo;
        child_spec.base_branch = Some(branch.clone());
        child_spec.target_branch = Some(branch.clone());
        child_spec.worktree_root = Some(format!("{}/{sub_id}", entry.spec.worktree_root()));

        match self.admit(
            child_spec,
            true,
            Some((entry.spec.id.clone(), sub_id.to_string())),
        ) {
            Ok(child_id) => {
                info!("sub-plan {sub_id} launched as plan {child_id} on {branch}");
                entry.state.pending_sub_plans.remove(sub_id);
                entry.state.running_sub_plans.insert(sub_id.to_string());
                entry
                    .state
                    .sub_plan_ids
                    .insert(sub_id.to_string(), child_id);
                entry
                    .state
                    .integration_branches
                    .insert(sub_id.to_string(), branch);
                entry
                    .state
                    .base_commits
                    .insert(sub_id.to_string(), base_commit);
                entry.state.touch();
            }
            Err(e) => {
                entry
                    .state
                    .record_error(format!("sub-plan {sub_id} admission failed: {e}"));
                entry.state.pending_sub_plans.remove(sub_id);
                entry.state.failed_sub_plans.insert(sub_id.to_string());
            }
        }
    }

    /// Fold a completed leaf into the plan's target branch and, when
    /// enabled, reap it.
    async fn merge_leaf(&self, entry: &mut PlanEntry, id: &str) {
        if entry.state.merged_leaves.contains(id) {
            return;
        }
        let Some(source) = entry.state.completed_commits.get(id).cloned() else {
            entry
                .state
                .record_error(format!("leaf {id} has no completed commit to merge"));
            return;
        };
        let target = entry
            .spec
            .target_branch
            .clone()
            .or_else(|| entry.state.target_branch_root.clone());
        let Some(target) = target else {
            entry.state.record_error("no target branch to merge into");
            return;
        };

        let request = MergeRequest {
            repo: entry.spec.repo_path.clone(),
            source_commit: source.clone(),
            target_branch: target.clone(),
            work_unit: id.to_string(),
            message: None,
        };
        match self.inner.merge.merge_to_target(&request).await {
            Ok(merged) => {
                info!(
                    "leaf {id} merged into {target} as {} (fast path: {})",
                    merged.commit, merged.fast_path
                );
                entry.state.merged_leaves.insert(id.to_string());
                let summary = self.summarize(entry, id, &source).await;
                entry.state.absorb_summary(&summary);
                if entry.spec.clean_up_successful_work {
                    let spec = entry.spec.clone();
                    let dag = entry.dag.clone();
                    cleanup::cleanup_work_unit(&self.inner.git, &spec, &mut entry.state, &dag, id)
                        .await;
                }
            }
            Err(failure) => {
                warn!("leaf merge of {id} into {target} failed: {failure}");
                entry
                    .state
                    .record_error(format!("merge of {id} into {target} failed: {failure}"));
                let index = entry.dag.index_of(id);
                if index.map(|i| entry.dag.is_job(i)) == Some(true) {
                    entry.state.transition(id, UnitBucket::Failed);
                } else {
                    entry.state.completed_sub_plans.remove(id);
                    entry.state.failed_sub_plans.insert(id.to_string());
                }
            }
        }
    }

    async fn summarize(&self, entry: &PlanEntry, id: &str, source: &str) -> WorkSummary {
        let Some(base) = entry.state.base_commits.get(id) else {
            return WorkSummary {
                commits: 1,
                ..Default::default()
            };
        };
        let repo = &entry.spec.repo_path;
        let commits = self
            .inner
            .git
            .commit_log(repo, base, source)
            .await
            .map(|log| log.len())
            .unwrap_or(0);
        let stats = self
            .inner
            .git
            .diff_stats(repo, base, source)
            .await
            .unwrap_or_default();
        WorkSummary {
            commits,
            files_changed: stats.files_changed,
            insertions: stats.insertions,
            deletions: stats.deletions,
        }
    }

    /// Plan completion: final status calculus, the reverse-integration
    /// sweep on success, and full resource cleanup when configured.
    async fn check_completion(&self, entry: &mut PlanEntry) {
        if !entry.state.all_work_settled() {
            return;
        }
        let mut status = entry.state.final_status();

        if status == PlanStatus::Succeeded {
            // RI merge: confirm every leaf made it into the target.
            let leaves: Vec<String> = entry.dag.leaves().iter().map(|s| s.to_string()).collect();
            for leaf in leaves {
                if !entry.state.merged_leaves.contains(&leaf)
                    && entry.state.completed_commits.contains_key(&leaf)
                {
                    self.merge_leaf(entry, &leaf).await;
                }
            }
            entry.state.ri_merge_completed = true;
            // A failed RI merge degrades the outcome.
            status = entry.state.final_status();
            if status == PlanStatus::Succeeded && entry.spec.clean_up_successful_work {
                let spec = entry.spec.clone();
                cleanup::cleanup_all_plan_resources(
                    &self.inner.git,
                    &spec,
                    &mut entry.state,
                    self.inner.config.merge.push_on_success,
                )
                .await;
            }
        }

        info!("plan {} completed: {status:?}", entry.spec.id);
        entry.state.status = status;
        entry.state.touch();
    }

    /// Cancel a plan and, transitively, its running sub-plans. Running jobs
    /// get their processes killed; termination is not awaited.
    pub async fn cancel(&self, plan_id: &str) {
        let mut pending = vec![plan_id.to_string()];
        while let Some(id) = pending.pop() {
            let Some(entry_ref) = self.entry(&id) else {
                continue;
            };
            let mut entry = entry_ref.lock().await;
            if entry.state.status.is_terminal() {
                continue;
            }

            for handle in entry.provisioning.values() {
                handle.abort();
            }
            entry.provisioning.clear();

            let running: Vec<String> = entry.state.running.iter().cloned().collect();
            for unit in &running {
                if let Some(runner_job_id) = entry.state.job_id_map.get(unit) {
                    self.inner.jobs.cancel(runner_job_id);
                }
            }
            // Everything not already delivered or failed is canceled,
            // including dependents that never became ready.
            let unfinished: Vec<String> = entry
                .dag
                .all_ids()
                .filter(|id| {
                    entry.dag.index_of(id).map(|i| entry.dag.is_job(i)) == Some(true)
                        && !entry.state.done.contains(*id)
                        && !entry.state.failed.contains(*id)
                })
                .map(str::to_string)
                .collect();
            for unit in unfinished {
                entry.state.transition(&unit, UnitBucket::Canceled);
            }

            pending.extend(
                entry
                    .state
                    .running_sub_plans
                    .iter()
                    .filter_map(|sub| entry.state.sub_plan_ids.get(sub).cloned()),
            );
            entry.state.pending_sub_plans.clear();
            entry.state.status = PlanStatus::Canceled;
            entry.state.touch();
            info!("plan {id} canceled");
        }
        self.persist_and_publish().await;
        self.poke();
    }

    /// Cancel (if needed) and reclaim everything the plan owns, then forget
    /// it.
    pub async fn delete(&self, plan_id: &str) {
        self.cancel(plan_id).await;
        if let Some(entry_ref) = self.entry(plan_id) {
            let mut entry = entry_ref.lock().await;
            let spec = entry.spec.clone();
            cleanup::cleanup_all_plan_resources(
                &self.inner.git,
                &spec,
                &mut entry.state,
                self.inner.config.merge.push_on_success,
            )
            .await;
            let children: Vec<String> = entry.state.sub_plan_ids.values().cloned().collect();
            drop(entry);
            for child in children {
                self.forget(&child);
            }
        }
        self.forget(plan_id);
        self.persist_and_publish().await;
    }

    fn forget(&self, plan_id: &str) {
        self.inner.plans.lock().unwrap().remove(plan_id);
        self.inner.order.lock().unwrap().retain(|id| id != plan_id);
    }

    /// Cached deep snapshot of every plan.
    pub async fn list(&self) -> Arc<Vec<PlanSnapshot>> {
        if let Some(cached) = self.inner.snapshot_cache.lock().unwrap().clone() {
            return cached;
        }
        let ids: Vec<String> = self.inner.order.lock().unwrap().clone();
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry_ref) = self.entry(&id) {
                let entry = entry_ref.lock().await;
                snapshots.push(PlanSnapshot {
                    id: entry.spec.id.clone(),
                    name: entry.spec.name.clone(),
                    is_sub_plan: entry.is_sub_plan,
                    state: entry.state.clone(),
                });
            }
        }
        let snapshots = Arc::new(snapshots);
        *self.inner.snapshot_cache.lock().unwrap() = Some(Arc::clone(&snapshots));
        snapshots
    }

    pub async fn get(&self, plan_id: &str) -> Option<PlanSnapshot> {
        let entry_ref = self.entry(plan_id)?;
        let entry = entry_ref.lock().await;
        Some(PlanSnapshot {
            id: entry.spec.id.clone(),
            name: entry.spec.name.clone(),
            is_sub_plan: entry.is_sub_plan,
            state: entry.state.clone(),
        })
    }

    /// Restore persisted plans. Provisioning futures do not survive a
    /// restart, so preparing jobs fall back to queued; running jobs are
    /// re-polled against the (already reconciled) job runner.
    pub fn load(&self) -> Result<(), StorageError> {
        let Some(file) = self.inner.store.load()? else {
            return Ok(());
        };
        for record in file.items {
            let dag = match DagIndex::build(&record.spec) {
                Ok(dag) => dag,
                Err(e) => {
                    warn!("skipping persisted plan {}: {e}", record.spec.id);
                    continue;
                }
            };
            let mut state = record.state;
            let preparing: Vec<String> = state.preparing.iter().cloned().collect();
            for id in preparing {
                state.transition(&id, UnitBucket::Queued);
            }
            let plan_id = record.spec.id.clone();
            let entry = PlanEntry {
                spec: record.spec,
                state,
                dag,
                is_sub_plan: record.is_sub_plan,
                parent: record.parent,
                provisioning: HashMap::new(),
            };
            self.inner
                .plans
                .lock()
                .unwrap()
                .insert(plan_id.clone(), Arc::new(AsyncMutex::new(entry)));
            self.inner.order.lock().unwrap().push(plan_id);
        }
        self.poke();
        Ok(())
    }

    pub async fn shutdown_flush(&self) -> Result<(), StorageError> {
        self.snapshot_to_store().await;
        self.inner.store.flush_sync()
    }

    async fn persist_and_publish(&self) {
        self.snapshot_to_store().await;

        let ids: Vec<String> = self.inner.order.lock().unwrap().clone();
        let mut hash = String::new();
        for id in ids {
            if let Some(entry_ref) = self.entry(&id) {
                let entry = entry_ref.lock().await;
                hash.push_str(&entry.state.state_hash(&id));
                hash.push(';');
            }
        }
        if self.inner.bus.publish(hash) {
            self.inner.snapshot_cache.lock().unwrap().take();
        }
    }

    async fn snapshot_to_store(&self) {
        let ids: Vec<String> = self.inner.order.lock().unwrap().clone();
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry_ref) = self.entry(&id) {
                let entry = entry_ref.lock().await;
                items.push(PlanRecord {
                    spec: entry.spec.clone(),
                    state: entry.state.clone(),
                    is_sub_plan: entry.is_sub_plan,
                    parent: entry.parent.clone(),
                });
            }
        }
        self.inner.store.schedule_save(PlansFile { items });
    }

    fn entry(&self, plan_id: &str) -> Option<EntryRef> {
        self.inner.plans.lock().unwrap().get(plan_id).cloned()
    }
}

fn in_any_bucket(state: &PlanState, id: &str) -> bool {
    state.queued.contains(id)
        || state.preparing.contains(id)
        || state.running.contains(id)
        || state.done.contains(id)
        || state.failed.contains(id)
        || state.canceled.contains(id)
}
