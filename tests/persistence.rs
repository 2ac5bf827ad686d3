//! Crash-recovery persistence across runtime instances.

mod common;

use std::time::Duration;

use foreman::app::Runtime;
use foreman::config::Config;
use foreman::plan::{PlanJobSpec, PlanSpec, PlanStatus};
use foreman::subprocess::SubprocessManager;

use common::*;

fn one_job_plan(id: &str, repo: &std::path::Path) -> PlanSpec {
    PlanSpec {
        id: id.to_string(),
        name: "persistence demo".to_string(),
        repo_path: repo.to_path_buf(),
        worktree_root: None,
        base_branch: None,
        target_branch: None,
        max_parallel: 0,
        jobs: vec![PlanJobSpec {
            id: "only".to_string(),
            name: None,
            task: "write a file".to_string(),
            consumes_from: vec![],
            policy: foreman::job::JobPolicy {
                work: "printf 'persisted\\n' > out.txt".to_string(),
                ..Default::default()
            },
            additional_instructions: None,
        }],
        sub_plans: vec![],
        clean_up_successful_work: true,
    }
}

#[tokio::test]
async fn completed_plan_survives_a_restart() {
    let fx = fixture();

    {
        let runtime = Runtime::with_parts(
            &fx.workspace,
            Config::default(),
            SubprocessManager::production(),
            arc_agent(StubAgent),
        )
        .unwrap();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(120),
            runtime.run_plan_to_completion(one_job_plan("per1", &fx.repo)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(snapshot.state.status, PlanStatus::Succeeded);
        runtime.shutdown().await;
    }

    // A fresh runtime over the same workspace sees the settled plan and its
    // jobs, with orphan reconciliation finding nothing to do.
    let runtime = Runtime::with_parts(
        &fx.workspace,
        Config::default(),
        SubprocessManager::production(),
        arc_agent(StubAgent),
    )
    .unwrap();
    runtime.load().unwrap();

    let snapshot = runtime.plans.get("per1").await.expect("plan restored");
    assert_eq!(snapshot.state.status, PlanStatus::Succeeded);
    assert!(snapshot.state.merged_leaves.contains("only"));

    let jobs = runtime.jobs.list();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].status.is_terminal());
}

#[tokio::test]
async fn persisted_plan_state_is_a_serialization_fixed_point() {
    let fx = fixture();
    let runtime = Runtime::with_parts(
        &fx.workspace,
        Config::default(),
        SubprocessManager::production(),
        arc_agent(StubAgent),
    )
    .unwrap();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(120),
        runtime.run_plan_to_completion(one_job_plan("per2", &fx.repo)),
    )
    .await
    .unwrap()
    .unwrap();
    runtime.shutdown().await;

    let first = serde_json::to_value(&snapshot.state).unwrap();
    let reparsed: foreman::plan::PlanState = serde_json::from_value(first.clone()).unwrap();
    let second = serde_json::to_value(&reparsed).unwrap();
    assert_eq!(first, second);
}
