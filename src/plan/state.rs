//! Mutable runtime state of a plan.
//!
//! The six work-unit sets are pairwise disjoint; their union is a subset of
//! the plan's declared units. Everything here serializes with string keys
//! so the persisted JSON stays portable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::job::{JobId, WorkSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    /// Some units delivered, some failed or were canceled.
    Partial,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PlanStatus::Queued | PlanStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanState {
    pub status: PlanStatus,

    pub queued: BTreeSet<String>,
    pub preparing: BTreeSet<String>,
    pub running: BTreeSet<String>,
    pub done: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub canceled: BTreeSet<String>,

    /// Jobs dispatched to the job runner.
    pub submitted: BTreeSet<String>,
    /// Plan-local id → runner job id.
    pub job_id_map: BTreeMap<String, JobId>,
    /// Plan-local id → commit the unit delivered.
    pub completed_commits: BTreeMap<String, String>,
    /// Plan-local id → SHA the unit's worktree was created at.
    pub base_commits: BTreeMap<String, String>,
    pub worktree_paths: BTreeMap<String, PathBuf>,

    pub target_branch_root: Option<String>,
    /// Whether the plan created the root (vs adopting the user's branch).
    pub target_branch_root_created: bool,

    pub merged_leaves: BTreeSet<String>,
    pub cleaned_work_units: BTreeSet<String>,

    pub pending_sub_plans: BTreeSet<String>,
    pub running_sub_plans: BTreeSet<String>,
    pub completed_sub_plans: BTreeSet<String>,
    pub failed_sub_plans: BTreeSet<String>,
    /// Plan-local sub-plan id → child plan id.
    pub sub_plan_ids: BTreeMap<String, String>,
    /// Plan-local sub-plan id → integration branch the child delivers to.
    pub integration_branches: BTreeMap<String, String>,

    pub ri_merge_completed: bool,
    /// Monoidal sum of per-leaf work summaries.
    pub work_summary: Option<WorkSummary>,
    pub errors: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            status: PlanStatus::Queued,
            queued: BTreeSet::new(),
            preparing: BTreeSet::new(),
            running: BTreeSet::new(),
            done: BTreeSet::new(),
            failed: BTreeSet::new(),
            canceled: BTreeSet::new(),
            submitted: BTreeSet::new(),
            job_id_map: BTreeMap::new(),
            completed_commits: BTreeMap::new(),
            base_commits: BTreeMap::new(),
            worktree_paths: BTreeMap::new(),
            target_branch_root: None,
            target_branch_root_created: false,
            merged_leaves: BTreeSet::new(),
            cleaned_work_units: BTreeSet::new(),
            pending_sub_plans: BTreeSet::new(),
            running_sub_plans: BTreeSet::new(),
            completed_sub_plans: BTreeSet::new(),
            failed_sub_plans: BTreeSet::new(),
            sub_plan_ids: BTreeMap::new(),
            integration_branches: BTreeMap::new(),
            ri_merge_completed: false,
            work_summary: None,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.touch();
    }

    /// Move a unit between the disjoint sets, keeping them disjoint.
    pub fn transition(&mut self, id: &str, to: UnitBucket) {
        for set in [
            &mut self.queued,
            &mut self.preparing,
            &mut self.running,
            &mut self.done,
            &mut self.failed,
            &mut self.canceled,
        ] {
            set.remove(id);
        }
        let set = match to {
            UnitBucket::Queued => &mut self.queued,
            UnitBucket::Preparing => &mut self.preparing,
            UnitBucket::Running => &mut self.running,
            UnitBucket::Done => &mut self.done,
            UnitBucket::Failed => &mut self.failed,
            UnitBucket::Canceled => &mut self.canceled,
        };
        set.insert(id.to_string());
        self.touch();
    }

    /// A producer is satisfied when it delivered (job done or sub-plan
    /// completed).
    pub fn producer_satisfied(&self, id: &str) -> bool {
        self.done.contains(id) || self.completed_sub_plans.contains(id)
    }

    /// No jobs in flight and no sub-plans outstanding.
    pub fn all_work_settled(&self) -> bool {
        self.queued.is_empty()
            && self.preparing.is_empty()
            && self.running.is_empty()
            && self.pending_sub_plans.is_empty()
            && self.running_sub_plans.is_empty()
    }

    /// Final status calculus once all work has settled.
    pub fn final_status(&self) -> PlanStatus {
        let any_failed = !self.failed.is_empty() || !self.failed_sub_plans.is_empty();
        let any_done = !self.done.is_empty() || !self.completed_sub_plans.is_empty();
        let any_canceled = !self.canceled.is_empty();

        if any_failed && any_done {
            PlanStatus::Partial
        } else if any_failed {
            PlanStatus::Failed
        } else if any_canceled && any_done {
            PlanStatus::Partial
        } else if any_canceled {
            PlanStatus::Canceled
        } else {
            PlanStatus::Succeeded
        }
    }

    pub fn absorb_summary(&mut self, summary: &WorkSummary) {
        self.work_summary
            .get_or_insert_with(WorkSummary::default)
            .absorb(summary);
        self.touch();
    }

    /// Lightweight hash for change coalescing: id, status, set lengths.
    pub fn state_hash(&self, plan_id: &str) -> String {
        format!(
            "{plan_id}:{:?}:{}/{}/{}/{}/{}/{}",
            self.status,
            self.queued.len(),
            self.preparing.len(),
            self.running.len(),
            self.done.len(),
            self.failed.len(),
            self.canceled.len(),
        )
    }
}

impl Default for PlanState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitBucket {
    Queued,
    Preparing,
    Running,
    Done,
    Failed,
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_keep_sets_disjoint() {
        let mut state = PlanState::new();
        state.transition("a", UnitBucket::Queued);
        state.transition("a", UnitBucket::Preparing);
        state.transition("a", UnitBucket::Running);
        state.transition("a", UnitBucket::Done);

        assert!(state.done.contains("a"));
        for set in [&state.queued, &state.preparing, &state.running, &state.failed] {
            assert!(!set.contains("a"));
        }
    }

    #[test]
    fn final_status_calculus() {
        let mut state = PlanState::new();
        state.done.insert("a".into());
        assert_eq!(state.final_status(), PlanStatus::Succeeded);

        state.failed.insert("b".into());
        assert_eq!(state.final_status(), PlanStatus::Partial);

        state.done.clear();
        assert_eq!(state.final_status(), PlanStatus::Failed);

        state.failed.clear();
        state.canceled.insert("c".into());
        assert_eq!(state.final_status(), PlanStatus::Canceled);

        state.done.insert("a".into());
        assert_eq!(state.final_status(), PlanStatus::Partial);
    }

    #[test]
    fn completed_sub_plans_count_as_delivered() {
        let mut state = PlanState::new();
        state.completed_sub_plans.insert("s".into());
        assert!(state.producer_satisfied("s"));
        assert_eq!(state.final_status(), PlanStatus::Succeeded);
    }

    #[test]
    fn hash_tracks_set_lengths() {
        let mut state = PlanState::new();
        let before = state.state_hash("p");
        state.transition("a", UnitBucket::Queued);
        let after = state.state_hash("p");
        assert_ne!(before, after);
        assert_eq!(after, state.state_hash("p"));
    }

    #[test]
    fn serializes_with_string_keys() {
        let mut state = PlanState::new();
        state.completed_commits.insert("a".into(), "sha".into());
        state.worktree_paths.insert("a".into(), PathBuf::from("/w/a"));
        let value = serde_json::to_value(&state).unwrap();
        assert!(value["completed_commits"].is_object());
        assert_eq!(value["completed_commits"]["a"], "sha");

        let back: PlanState = serde_json::from_value(value).unwrap();
        assert_eq!(back.completed_commits["a"], "sha");
    }
}
