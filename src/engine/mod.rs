// src/engine/mod.rs

//! Submission engine.
//!
//! This module ties together:
//! - per-job planning (worker, execution environment, translated resources),
//! - the dependency resolver of each submitted flow,
//! - the remote transports that run and report on jobs,
//! - the transition log.
//!
//! The pure per-flow state machine lives in [`core`] ([`FlowRun`]); the
//! async/IO shell that owns transports, the store and one monitoring task per
//! flow is implemented in [`runtime`] ([`SubmissionEngine`]).

use std::fmt;

use serde::Serialize;

use crate::dag::JobState;
use crate::store::LogEntry;
use crate::transport::{DispatchRequest, RemoteHandle, RemoteState};
use crate::types::{FlowId, JobId, JobStatus};

pub mod core;
pub mod plan;
pub mod runtime;

pub use core::FlowRun;
pub use plan::{JobPlan, plan_flow};
pub use runtime::{EngineBuilder, EngineOptions, SubmissionEngine};

/// Results of transport calls, fed back into [`FlowRun::step`].
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The backend accepted the job.
    Dispatched { job: JobId, handle: RemoteHandle },
    /// Dispatch failed for good (retries exhausted or rejected).
    DispatchFailed { job: JobId, error: String },
    Polled { job: JobId, state: RemoteState },
    /// Polling failed for good; the job's outcome is unknown.
    PollFailed { job: JobId, error: String },
    /// Answer to a remote cancel request.
    CancelAcknowledged { job: JobId, confirmed: bool },
}

impl EngineEvent {
    pub fn job(&self) -> &str {
        match self {
            EngineEvent::Dispatched { job, .. }
            | EngineEvent::DispatchFailed { job, .. }
            | EngineEvent::Polled { job, .. }
            | EngineEvent::PollFailed { job, .. }
            | EngineEvent::CancelAcknowledged { job, .. } => job,
        }
    }
}

/// A job to hand to a worker.
#[derive(Debug, Clone)]
pub struct DispatchOrder {
    pub job: JobId,
    pub worker: String,
    pub request: DispatchRequest,
}

/// A job already known to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteJobRef {
    pub job: JobId,
    pub worker: String,
    pub handle: RemoteHandle,
}

/// Command produced by the pure core, to be executed by the IO shell.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Dispatch(Vec<DispatchOrder>),
    Poll(Vec<RemoteJobRef>),
    CancelRemote(Vec<RemoteJobRef>),
}

/// Decision returned by the core after handling one event or action.
#[derive(Debug, Clone, Default)]
pub struct CoreStep {
    /// Transport calls the shell should make.
    pub commands: Vec<EngineCommand>,
    /// Entries to persist before the step's effects become visible.
    pub log: Vec<LogEntry>,
    /// Every job is terminal and nothing is in flight.
    pub finished: bool,
}

impl CoreStep {
    pub fn dispatched_jobs(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                EngineCommand::Dispatch(orders) => Some(orders),
                _ => None,
            })
            .flatten()
            .map(|o| o.job.as_str())
            .collect()
    }
}

/// Opaque reference to a submitted flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubmissionHandle {
    pub flow_id: FlowId,
}

impl SubmissionHandle {
    pub fn new(flow_id: impl Into<FlowId>) -> Self {
        Self {
            flow_id: flow_id.into(),
        }
    }
}

impl fmt::Display for SubmissionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flow_id)
    }
}

/// Snapshot of a flow, jobs in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStatus {
    pub flow_id: FlowId,
    pub name: String,
    pub jobs: Vec<JobState>,
    pub finished: bool,
}

impl FlowStatus {
    pub fn status_of(&self, job: &str) -> Option<JobStatus> {
        self.jobs.iter().find(|j| j.id == job).map(|j| j.status)
    }

    pub fn reason_of(&self, job: &str) -> Option<&str> {
        self.jobs
            .iter()
            .find(|j| j.id == job)
            .and_then(|j| j.reason.as_deref())
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn all_completed(&self) -> bool {
        self.jobs.iter().all(|j| j.status == JobStatus::Completed)
    }
}
