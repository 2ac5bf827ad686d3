//! Plan specifications and the admission-time DAG index.

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::job::JobPolicy;

fn default_true() -> bool {
    true
}

/// Immutable user-authored plan definition. Defaults are filled in once at
/// admission; the spec is never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    /// Assigned at admission when absent.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub repo_path: PathBuf,
    /// Relative directory under the repo holding this plan's worktrees;
    /// defaults to `.worktrees/<planId>`.
    #[serde(default)]
    pub worktree_root: Option<String>,
    /// Defaults to `main`.
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Branch leaves merge into; defaults to the resolved target branch
    /// root.
    #[serde(default)]
    pub target_branch: Option<String>,
    /// 0 means use the configured scheduler default.
    #[serde(default)]
    pub max_parallel: usize,
    #[serde(default)]
    pub jobs: Vec<PlanJobSpec>,
    #[serde(default)]
    pub sub_plans: Vec<SubPlanSpec>,
    #[serde(default = "default_true")]
    pub clean_up_successful_work: bool,
}

/// One job node of the DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanJobSpec {
    /// Plan-local id, referenced by siblings' `consumes_from`.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub task: String,
    #[serde(default)]
    pub consumes_from: Vec<String>,
    #[serde(default)]
    pub policy: JobPolicy,
    #[serde(default)]
    pub additional_instructions: Option<String>,
}

impl PlanJobSpec {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A nested plan node: launched when its producers complete, delivering a
/// single integration commit to the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubPlanSpec {
    /// Plan-local id in the parent DAG.
    pub id: String,
    #[serde(default)]
    pub consumes_from: Vec<String>,
    pub plan: PlanSpec,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("plan has no work units")]
    Empty,

    #[error("duplicate work-unit id: {0}")]
    DuplicateId(String),

    #[error("work unit {unit} consumes from unknown sibling {producer}")]
    UnknownProducer { unit: String, producer: String },

    #[error("work unit {0} consumes from itself")]
    SelfEdge(String),

    #[error("consumes_from edges form a cycle")]
    Cycle,
}

impl PlanSpec {
    /// Fill admission-time defaults. Idempotent.
    pub fn normalized(mut self) -> Self {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.worktree_root.is_none() {
            self.worktree_root = Some(format!(".worktrees/{}", self.id));
        }
        if self.base_branch.is_none() {
            self.base_branch = Some("main".to_string());
        }
        self
    }

    pub fn worktree_root(&self) -> &str {
        self.worktree_root.as_deref().unwrap_or(".worktrees")
    }

    pub fn base_branch(&self) -> &str {
        self.base_branch.as_deref().unwrap_or("main")
    }
}

/// Arena-indexed view of a plan's DAG: jobs first, sub-plans after, edges
/// resolved to indices once at admission so every traversal is iterative.
#[derive(Debug, Clone)]
pub struct DagIndex {
    ids: Vec<String>,
    index_of: HashMap<String, usize>,
    consumes: Vec<Vec<usize>>,
    consumers: Vec<Vec<usize>>,
    job_count: usize,
}

impl DagIndex {
    pub fn build(spec: &PlanSpec) -> Result<Self, AdmissionError> {
        let mut ids: Vec<String> = Vec::new();
        let mut edges: Vec<Vec<String>> = Vec::new();
        for job in &spec.jobs {
            ids.push(job.id.clone());
            edges.push(job.consumes_from.clone());
        }
        let job_count = ids.len();
        for sub in &spec.sub_plans {
            ids.push(sub.id.clone());
            edges.push(sub.consumes_from.clone());
        }
        if ids.is_empty() {
            return Err(AdmissionError::Empty);
        }

        let mut index_of = HashMap::new();
        for (index, id) in ids.iter().enumerate() {
            if index_of.insert(id.clone(), index).is_some() {
                return Err(AdmissionError::DuplicateId(id.clone()));
            }
        }

        let mut consumes = vec![Vec::new(); ids.len()];
        let mut consumers = vec![Vec::new(); ids.len()];
        for (index, producers) in edges.iter().enumerate() {
            for producer in producers {
                let producer_index =
                    *index_of
                        .get(producer)
                        .ok_or_else(|| AdmissionError::UnknownProducer {
                            unit: ids[index].clone(),
                            producer: producer.clone(),
                        })?;
                if producer_index == index {
                    return Err(AdmissionError::SelfEdge(ids[index].clone()));
                }
                consumes[index].push(producer_index);
                consumers[producer_index].push(index);
            }
        }

        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..ids.len()).map(|i| graph.add_node(i)).collect();
        for (consumer, producers) in consumes.iter().enumerate() {
            for producer in producers {
                graph.add_edge(nodes[*producer], nodes[consumer], ());
            }
        }
        toposort(&graph, None).map_err(|_| AdmissionError::Cycle)?;

        Ok(Self {
            ids,
            index_of,
            consumes,
            consumers,
            job_count,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: usize) -> &str {
        &self.ids[index]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index_of.get(id).copied()
    }

    pub fn is_job(&self, index: usize) -> bool {
        index < self.job_count
    }

    /// Producer ids of `id`, in declaration order.
    pub fn producers_of(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|index| {
                self.consumes[index]
                    .iter()
                    .map(|p| self.ids[*p].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Consumer ids of `id`.
    pub fn consumers_of(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|index| {
                self.consumers[index]
                    .iter()
                    .map(|c| self.ids[*c].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A leaf is a unit no sibling consumes from.
    pub fn is_leaf(&self, id: &str) -> bool {
        self.index_of(id)
            .map(|index| self.consumers[index].is_empty())
            .unwrap_or(false)
    }

    pub fn leaves(&self) -> Vec<&str> {
        self.ids
            .iter()
            .enumerate()
            .filter(|(index, _)| self.consumers[*index].is_empty())
            .map(|(_, id)| id.as_str())
            .collect()
    }

    /// Units with no producers, runnable at admission.
    pub fn roots(&self) -> Vec<&str> {
        self.ids
            .iter()
            .enumerate()
            .filter(|(index, _)| self.consumes[*index].is_empty())
            .map(|(_, id)| id.as_str())
            .collect()
    }

    pub fn all_ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, consumes: &[&str]) -> PlanJobSpec {
        PlanJobSpec {
            id: id.to_string(),
            name: None,
            task: format!("task {id}"),
            consumes_from: consumes.iter().map(|s| s.to_string()).collect(),
            policy: JobPolicy::default(),
            additional_instructions: None,
        }
    }

    fn plan(jobs: Vec<PlanJobSpec>) -> PlanSpec {
        PlanSpec {
            id: "p1".into(),
            name: "test".into(),
            repo_path: PathBuf::from("/repo"),
            worktree_root: None,
            base_branch: None,
            target_branch: None,
            max_parallel: 0,
            jobs,
            sub_plans: vec![],
            clean_up_successful_work: true,
        }
    }

    #[test]
    fn normalization_fills_defaults() {
        let mut spec = plan(vec![job("a", &[])]);
        spec.id = String::new();
        let spec = spec.normalized();
        assert!(!spec.id.is_empty());
        assert_eq!(spec.base_branch(), "main");
        assert_eq!(spec.worktree_root(), &format!(".worktrees/{}", spec.id));
    }

    #[test]
    fn diamond_dag_roots_and_leaves() {
        let spec = plan(vec![
            job("a", &[]),
            job("b", &["a"]),
            job("c", &["a"]),
            job("d", &["b", "c"]),
        ]);
        let dag = DagIndex::build(&spec).unwrap();
        assert_eq!(dag.roots(), vec!["a"]);
        assert_eq!(dag.leaves(), vec!["d"]);
        assert!(!dag.is_leaf("a"));
        assert!(dag.is_leaf("d"));
        assert_eq!(dag.producers_of("d"), vec!["b", "c"]);
        let mut consumers = dag.consumers_of("a");
        consumers.sort();
        assert_eq!(consumers, vec!["b", "c"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let spec = plan(vec![job("a", &["b"]), job("b", &["a"])]);
        assert_eq!(DagIndex::build(&spec).unwrap_err(), AdmissionError::Cycle);
    }

    #[test]
    fn self_edge_is_rejected() {
        let spec = plan(vec![job("a", &["a"])]);
        assert_eq!(
            DagIndex::build(&spec).unwrap_err(),
            AdmissionError::SelfEdge("a".into())
        );
    }

    #[test]
    fn unknown_producer_is_rejected() {
        let spec = plan(vec![job("a", &["ghost"])]);
        assert_eq!(
            DagIndex::build(&spec).unwrap_err(),
            AdmissionError::UnknownProducer {
                unit: "a".into(),
                producer: "ghost".into()
            }
        );
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let spec = plan(vec![job("a", &[]), job("a", &[])]);
        assert_eq!(
            DagIndex::build(&spec).unwrap_err(),
            AdmissionError::DuplicateId("a".into())
        );
    }

    #[test]
    fn empty_plan_is_rejected() {
        let spec = plan(vec![]);
        assert_eq!(DagIndex::build(&spec).unwrap_err(), AdmissionError::Empty);
    }

    #[test]
    fn sub_plans_join_the_arena_after_jobs() {
        let mut spec = plan(vec![job("a", &[])]);
        spec.sub_plans.push(SubPlanSpec {
            id: "nested".into(),
            consumes_from: vec!["a".into()],
            plan: plan(vec![job("inner", &[])]),
        });
        let dag = DagIndex::build(&spec).unwrap();
        assert_eq!(dag.len(), 2);
        assert!(dag.is_job(dag.index_of("a").unwrap()));
        assert!(!dag.is_job(dag.index_of("nested").unwrap()));
        assert_eq!(dag.leaves(), vec!["nested"]);
    }

    #[test]
    fn plan_spec_parses_from_yaml() {
        let yaml = r#"
name: demo
repo_path: /repo
base_branch: develop
jobs:
  - id: a
    task: write code
    policy:
      work: "echo hi"
  - id: b
    task: review
    consumes_from: [a]
"#;
        let spec: PlanSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.jobs.len(), 2);
        assert_eq!(spec.jobs[1].consumes_from, vec!["a".to_string()]);
        assert!(spec.clean_up_successful_work);
        let dag = DagIndex::build(&spec.normalized()).unwrap();
        assert_eq!(dag.leaves(), vec!["b"]);
    }
}
