// src/dag/resolver.rs

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::dag::graph::DagGraph;
use crate::dag::job_info::{JobInfo, JobState, ReadyJob, StatusChange};
use crate::dag::resolver_step::ResolverStep;
use crate::dag::state_manager::StateManager;
use crate::errors::{RemoteflowError, Result};
use crate::flow::{Flow, OutputMap};
use crate::types::{JobId, JobStatus};

/// Dependency resolution for one flow.
///
/// Owns the immutable dependency graph plus the mutable status of every job
/// and the outputs published so far. It is responsible for:
/// - deciding which jobs are ready (all producers completed),
/// - publishing outputs when a job completes and re-checking its direct
///   dependents exactly once,
/// - cancelling the transitive dependents of a failed job,
/// - detecting when every job has reached a terminal state.
///
/// It performs no IO; the engine feeds it remote events.
#[derive(Debug)]
pub struct DependencyResolver {
    graph: DagGraph,
    jobs: HashMap<JobId, JobInfo>,
    published: HashMap<JobId, OutputMap>,
}

impl DependencyResolver {
    /// Validate `flow` and set every job to `Pending`.
    pub fn new(flow: &Flow) -> Result<Self> {
        flow.validate()?;

        let graph = DagGraph::from_flow(flow);
        let jobs = flow
            .flatten()
            .into_iter()
            .map(|node| (node.id.clone(), JobInfo::new(node)))
            .collect();

        Ok(Self {
            graph,
            jobs,
            published: HashMap::new(),
        })
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    pub fn job(&self, id: &str) -> Option<&JobInfo> {
        self.jobs.get(id)
    }

    pub fn status_of(&self, id: &str) -> Option<JobStatus> {
        self.jobs.get(id).map(|info| info.status)
    }

    pub fn outputs_of(&self, id: &str) -> Option<&OutputMap> {
        self.published.get(id)
    }

    /// Concrete inputs of `job`, or `None` while a producer has not
    /// published yet.
    pub fn resolved_arguments(&self, job: &str) -> Option<ReadyJob> {
        ReadyJob::resolve(self.jobs.get(job)?, &self.published)
    }

    /// Per-job state in declaration order.
    pub fn snapshot(&self) -> Vec<JobState> {
        self.graph
            .jobs()
            .filter_map(|id| self.jobs.get(id))
            .map(JobState::from)
            .collect()
    }

    /// Ids with the given status, in declaration order.
    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<JobId> {
        self.graph
            .jobs()
            .filter(|id| self.status_of(id) == Some(status))
            .map(str::to_string)
            .collect()
    }

    /// Every job is `Completed`, `Failed` or `Cancelled`.
    pub fn is_finished(&self) -> bool {
        self.jobs.values().all(|info| info.status.is_terminal())
    }

    pub fn submission_order(&self) -> Vec<JobId> {
        self.graph
            .submission_order()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Full readiness pass over every `Pending` job.
    ///
    /// Safe to call repeatedly: jobs already reported are no longer
    /// `Pending` and are skipped.
    pub fn collect_ready(&mut self) -> ResolverStep {
        let candidates = self.jobs_with_status(JobStatus::Pending);
        self.with_manager(|mgr| {
            let ready = mgr.promote_ready(candidates);
            Ok(ResolverStep::ready(ready))
        })
        .unwrap_or_default()
    }

    pub fn mark_submitted(&mut self, job: &str) -> Result<ResolverStep> {
        self.simple_transition(job, JobStatus::Submitted, None)
    }

    pub fn mark_running(&mut self, job: &str) -> Result<ResolverStep> {
        self.simple_transition(job, JobStatus::Running, None)
    }

    /// Mark `job` completed, publish its declared outputs and re-evaluate its
    /// direct dependents.
    ///
    /// Declared slots missing from `outputs` are published as `null`.
    pub fn handle_completion(&mut self, job: &str, mut outputs: OutputMap) -> Result<ResolverStep> {
        let declared = self
            .jobs
            .get(job)
            .ok_or_else(|| RemoteflowError::UnknownJob(job.to_string()))?
            .node
            .outputs
            .clone();

        for slot in &declared {
            if !outputs.contains_key(slot) {
                warn!(job = %job, slot = %slot, "declared output missing; publishing null");
                outputs.insert(slot.clone(), serde_json::Value::Null);
            }
        }

        let dependents: Vec<String> = self
            .graph
            .dependents_of(job)
            .into_iter()
            .map(str::to_string)
            .collect();

        // Publish only once the transition is known to be legal.
        let from = self.status_of(job);
        if !from.is_some_and(|s| s.can_transition_to(JobStatus::Completed)) {
            return Err(RemoteflowError::InvalidTransition {
                job: job.to_string(),
                from: from.unwrap_or(JobStatus::Pending),
                to: JobStatus::Completed,
            });
        }
        self.published.insert(job.to_string(), outputs);

        self.with_manager(|mgr| {
            mgr.transition(job, JobStatus::Completed, None)?;
            info!(job = %job, dependents = dependents.len(), "job completed; outputs published");
            let ready = mgr.promote_ready(dependents);
            Ok(ResolverStep::ready(ready))
        })
    }

    /// Mark `job` failed and cancel everything downstream of it.
    pub fn handle_failure(&mut self, job: &str, reason: impl Into<String>) -> Result<ResolverStep> {
        let reason = reason.into();
        self.with_manager(|mgr| {
            mgr.transition(job, JobStatus::Failed, Some(reason.clone()))?;
            warn!(job = %job, reason = %reason, "job failed");
            let cancelled = mgr.cancel_dependents(job);
            Ok(ResolverStep::cancelled(cancelled))
        })
    }

    /// Cancel a single non-terminal job.
    ///
    /// Its dependents can never run either, so they are cancelled too.
    pub fn cancel_job(&mut self, job: &str, reason: impl Into<String>) -> Result<ResolverStep> {
        let reason = reason.into();
        self.with_manager(|mgr| {
            mgr.transition(job, JobStatus::Cancelled, Some(reason))?;
            let mut cancelled = vec![job.to_string()];
            cancelled.extend(mgr.cancel_dependents(job));
            Ok(ResolverStep::cancelled(cancelled))
        })
    }

    /// Cancel every job that has not been dispatched yet (`Pending` and
    /// `Ready`). Active jobs are left to the caller.
    pub fn cancel_undispatched(&mut self, reason: &str) -> ResolverStep {
        let mut targets = self.jobs_with_status(JobStatus::Pending);
        targets.extend(self.jobs_with_status(JobStatus::Ready));

        self.with_manager(|mgr| {
            let mut cancelled = Vec::new();
            for id in targets {
                if mgr
                    .transition(&id, JobStatus::Cancelled, Some(reason.to_string()))
                    .is_ok()
                {
                    cancelled.push(id);
                }
            }
            Ok(ResolverStep::cancelled(cancelled))
        })
        .unwrap_or_default()
    }

    /// Operator action: put a `Failed` job back to `Pending` and re-check it.
    ///
    /// Dependents cancelled because of the failure stay cancelled; re-running
    /// them requires submitting the flow again.
    pub fn requeue(&mut self, job: &str) -> Result<ResolverStep> {
        self.with_manager(|mgr| {
            mgr.transition(job, JobStatus::Pending, Some("requeued by operator".to_string()))?;
            info!(job = %job, "failed job requeued");
            let ready = mgr.promote_ready([job]);
            Ok(ResolverStep::ready(ready))
        })
    }

    /// Put a job straight into a recorded state, bypassing transition checks.
    /// Used when rebuilding a flow from the transition log.
    pub fn restore(
        &mut self,
        job: &str,
        status: JobStatus,
        reason: Option<String>,
        outputs: Option<OutputMap>,
    ) -> Result<()> {
        let info = self
            .jobs
            .get_mut(job)
            .ok_or_else(|| RemoteflowError::UnknownJob(job.to_string()))?;
        debug!(job = %job, %status, "restoring job status");
        info.status = status;
        info.reason = reason;
        if let Some(outputs) = outputs {
            self.published.insert(job.to_string(), outputs);
        }
        Ok(())
    }

    fn simple_transition(
        &mut self,
        job: &str,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<ResolverStep> {
        self.with_manager(|mgr| {
            mgr.transition(job, to, reason)?;
            Ok(ResolverStep::default())
        })
    }

    /// Run `f` against a fresh [`StateManager`], then attach the recorded
    /// transitions and the "just finished" flag to its step.
    ///
    /// On error nothing is returned, but transitions applied before the error
    /// stay applied; callers only fail on their first transition.
    fn with_manager<F>(&mut self, f: F) -> Result<ResolverStep>
    where
        F: FnOnce(&mut StateManager<'_>) -> Result<ResolverStep>,
    {
        let was_finished = self.is_finished();
        let mut mgr = StateManager::new(&self.graph, &mut self.jobs, &self.published);
        let result = f(&mut mgr);
        let changes: Vec<StatusChange> = mgr.into_changes();

        let mut step = result?;
        step.transitions = changes;
        step.flow_just_finished = !was_finished && self.is_finished();
        if step.flow_just_finished {
            info!("all jobs terminal; flow finished");
        }
        Ok(step)
    }
}
