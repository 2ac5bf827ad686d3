//! The cleanup reaper: consumer-gated worktree and branch reclamation.
//!
//! A merged leaf is reclaimed immediately; a producer only once every one
//! of its consumers (jobs and sub-plans alike) has been reclaimed, walking
//! the DAG iteratively toward the roots.

use std::path::Path;
use tracing::{debug, warn};

use super::spec::{DagIndex, PlanSpec};
use super::state::PlanState;
use crate::git::GitService;

/// Reclaim one work unit, then any producers that became eligible.
/// Idempotent: already-cleaned units are skipped.
pub async fn cleanup_work_unit(
    git: &GitService,
    spec: &PlanSpec,
    state: &mut PlanState,
    dag: &DagIndex,
    id: &str,
) {
    let mut pending = vec![id.to_string()];
    while let Some(unit) = pending.pop() {
        if state.cleaned_work_units.contains(&unit) {
            continue;
        }

        if let Some(worktree) = state.worktree_paths.get(&unit).cloned() {
            if !git
                .remove_worktree_safe(&spec.repo_path, &worktree, true)
                .await
            {
                // Non-fatal: leave it for a later cycle or the final sweep.
                warn!(
                    "could not remove worktree {} for {unit}; retrying later",
                    worktree.display()
                );
                continue;
            }
            state.worktree_paths.remove(&unit);
        }

        state.completed_commits.remove(&unit);
        state.base_commits.remove(&unit);
        state.cleaned_work_units.insert(unit.clone());
        state.touch();
        debug!("reclaimed work unit {unit}");

        for producer in dag.producers_of(&unit) {
            if can_cleanup_producer(state, dag, producer) {
                pending.push(producer.to_string());
            }
        }
    }
}

/// A producer may be reclaimed once it has delivered, has not been
/// reclaimed yet, and every consumer of it has been reclaimed.
pub fn can_cleanup_producer(state: &PlanState, dag: &DagIndex, producer: &str) -> bool {
    if !state.producer_satisfied(producer) {
        return false;
    }
    if state.cleaned_work_units.contains(producer) {
        return false;
    }
    dag.consumers_of(producer)
        .iter()
        .all(|consumer| state.cleaned_work_units.contains(*consumer))
}

/// Tear down everything the plan still owns: remaining worktrees, tracking
/// maps, integration branches, the plan's worktree root directory, and any
/// stale `_merge_*` temporary worktrees under `<repo>/.worktrees`.
/// Invoked on explicit delete or final success.
pub async fn cleanup_all_plan_resources(
    git: &GitService,
    spec: &PlanSpec,
    state: &mut PlanState,
    delete_remote_branches: bool,
) {
    let worktrees = std::mem::take(&mut state.worktree_paths);
    for (unit, worktree) in worktrees {
        if git
            .remove_worktree_safe(&spec.repo_path, &worktree, true)
            .await
        {
            state.cleaned_work_units.insert(unit);
        } else {
            warn!("leaving worktree {} behind", worktree.display());
        }
    }
    state.completed_commits.clear();
    state.base_commits.clear();

    let branches: Vec<String> = state.integration_branches.values().cloned().collect();
    state.integration_branches.clear();
    for branch in branches {
        if git.branch_exists(&spec.repo_path, &branch).await {
            if let Err(e) = git.delete_local_branch(&spec.repo_path, &branch).await {
                warn!("could not delete integration branch {branch}: {e}");
            }
        }
        if delete_remote_branches {
            if let Err(e) = git.delete_remote_branch(&spec.repo_path, &branch).await {
                debug!("remote deletion of {branch} skipped: {e}");
            }
        }
    }

    let root = spec.repo_path.join(spec.worktree_root());
    if root.exists() {
        if let Err(e) = std::fs::remove_dir_all(&root) {
            warn!("could not remove worktree root {}: {e}", root.display());
        }
    }

    sweep_stale_merge_worktrees(git, &spec.repo_path).await;
    state.touch();
}

/// Remove leftover `_merge_*` temporary worktrees from interrupted merges.
async fn sweep_stale_merge_worktrees(git: &GitService, repo: &Path) {
    let dir = repo.join(".worktrees");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("_merge_") {
            debug!("sweeping stale merge worktree {name}");
            git.remove_worktree_safe(repo, &entry.path(), true).await;
        }
    }
}
