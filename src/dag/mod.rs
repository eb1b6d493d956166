// src/dag/mod.rs

//! Dependency graph and readiness resolution.
//!
//! - [`graph`] holds the producer -> consumer graph of a validated flow.
//! - [`resolver`] contains the per-flow state machine that decides which
//!   jobs are ready and propagates failures downstream.
//! - [`job_info`] provides per-job state and the resolved [`ReadyJob`].
//! - [`resolver_step`] defines the result type of a resolver call.
//! - [`state_manager`] applies and records individual transitions.

pub mod graph;
pub mod job_info;
pub mod resolver;
pub mod resolver_step;
pub mod state_manager;

pub use graph::DagGraph;
pub use job_info::{JobInfo, JobState, ReadyJob, StatusChange};
pub use resolver::DependencyResolver;
pub use resolver_step::ResolverStep;
