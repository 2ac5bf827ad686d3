//! Foreman: a scheduler for parallel agent-driven coding jobs.
//!
//! Foreman runs multi-step coding tasks inside isolated git worktrees and
//! folds their results back into a user-chosen target branch. Each task (a
//! job) executes a fixed pipeline of phases; a plan composes many jobs as a
//! DAG in which downstream jobs observe upstream jobs' committed output.
//!
//! # Architecture
//!
//! - [`subprocess`] - process abstraction with a mockable runner
//! - [`git`] - typed async wrappers over the git CLI
//! - [`agent`] - delegation seam for the external agent CLI
//! - [`job`] - job specs, the phase executor, and the bounded job runner
//! - [`merge`] - per-target-branch serialized merges with user-state
//!   preservation
//! - [`plan`] - DAG admission, the pump cycle, provisioning, leaf merges,
//!   and resource cleanup
//! - [`storage`] - debounced crash-recovery persistence
//! - [`events`] - coalesced change notifications
//!
//! The scheduler is single-threaded cooperative: one logical pump task that
//! yields only at await points, poked by a notifier whenever state changes
//! and by a ticker otherwise.

pub mod agent;
pub mod app;
pub mod cli;
pub mod config;
pub mod events;
pub mod git;
pub mod job;
pub mod merge;
pub mod plan;
pub mod storage;
pub mod subprocess;
