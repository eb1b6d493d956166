// src/engine/core.rs

//! Pure per-flow state machine.
//!
//! [`FlowRun`] consumes [`EngineEvent`]s (results of transport calls) and
//! operator actions, and produces:
//! - updated job states (through the [`DependencyResolver`]),
//! - [`EngineCommand`]s describing which transport calls to make next,
//! - the [`LogEntry`]s that must be persisted for those changes.
//!
//! It has no Tokio types, performs no IO and takes the current time as a
//! parameter, so it can be tested step by step.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::dag::{DependencyResolver, ReadyJob, ResolverStep};
use crate::engine::plan::JobPlan;
use crate::engine::{
    CoreStep, DispatchOrder, EngineCommand, EngineEvent, FlowStatus, RemoteJobRef,
};
use crate::errors::{RemoteflowError, Result};
use crate::flow::Flow;
use crate::store::{LogEntry, ReplayedFlow, SubmissionRecord, TransitionRecord};
use crate::transport::{DispatchRequest, JobPayload, RemoteHandle, RemoteState};
use crate::types::{FlowId, JobId, JobStatus};

const OPERATOR_CANCEL: &str = "cancelled by operator";

/// State of one submitted flow.
#[derive(Debug)]
pub struct FlowRun {
    flow_id: FlowId,
    name: String,
    resolver: DependencyResolver,
    plans: BTreeMap<JobId, JobPlan>,
    records: BTreeMap<JobId, SubmissionRecord>,
    /// Dispatch issued, no answer yet. A job in here is never dispatched
    /// again.
    in_flight: HashSet<JobId>,
    /// Remote cancel issued, no answer yet.
    cancelling: HashSet<JobId>,
    cancel_requested: bool,
}

impl FlowRun {
    /// Build the run; `plans` must cover every job of `flow`.
    pub fn new(flow: &Flow, plans: BTreeMap<JobId, JobPlan>) -> Result<Self> {
        let resolver = DependencyResolver::new(flow)?;
        if let Some(missing) = flow.job_ids().into_iter().find(|id| !plans.contains_key(id)) {
            return Err(RemoteflowError::UnknownJob(missing));
        }

        Ok(Self {
            flow_id: flow.id.clone(),
            name: flow.name.clone(),
            resolver,
            plans,
            records: BTreeMap::new(),
            in_flight: HashSet::new(),
            cancelling: HashSet::new(),
            cancel_requested: false,
        })
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn records(&self) -> &BTreeMap<JobId, SubmissionRecord> {
        &self.records
    }

    pub fn plan(&self, job: &str) -> Option<&JobPlan> {
        self.plans.get(job)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Every job is terminal and no dispatch is awaiting an answer.
    pub fn is_finished(&self) -> bool {
        self.resolver.is_finished() && self.in_flight.is_empty()
    }

    pub fn snapshot(&self) -> FlowStatus {
        FlowStatus {
            flow_id: self.flow_id.clone(),
            name: self.name.clone(),
            jobs: self.resolver.snapshot(),
            finished: self.is_finished(),
        }
    }

    /// `Submitted`/`Running` jobs with their remote handles.
    pub fn active_jobs(&self) -> Vec<RemoteJobRef> {
        self.resolver
            .jobs_with_status(JobStatus::Submitted)
            .into_iter()
            .chain(self.resolver.jobs_with_status(JobStatus::Running))
            .filter_map(|id| self.remote_ref(&id))
            .collect()
    }

    fn remote_ref(&self, job: &str) -> Option<RemoteJobRef> {
        let record = self.records.get(job)?;
        Some(RemoteJobRef {
            job: job.to_string(),
            worker: record.worker.clone(),
            handle: record.remote_handle.clone(),
        })
    }

    /// Initial step after submission: dispatch every job without inputs.
    pub fn start(&mut self, now: DateTime<Utc>) -> CoreStep {
        let ready = self.resolver.collect_ready();
        let mut out = CoreStep::default();
        self.absorb(ready, now, &mut out);
        self.finish(out)
    }

    /// One poll round over every active job.
    pub fn poll_step(&self) -> CoreStep {
        let targets = self.active_jobs();
        let mut out = CoreStep::default();
        if !targets.is_empty() {
            out.commands.push(EngineCommand::Poll(targets));
        }
        out.finished = self.is_finished();
        out
    }

    /// Apply one transport result.
    pub fn step(&mut self, event: EngineEvent, now: DateTime<Utc>) -> CoreStep {
        debug!(flow = %self.flow_id, job = %event.job(), "flow run received event");
        let mut out = CoreStep::default();

        match event {
            EngineEvent::Dispatched { job, handle } => self.on_dispatched(job, handle, now, &mut out),
            EngineEvent::DispatchFailed { job, error } => {
                self.in_flight.remove(&job);
                if self.resolver.status_of(&job) == Some(JobStatus::Ready) {
                    self.fail(&job, format!("dispatch failed: {error}"), now, &mut out);
                } else {
                    debug!(job = %job, error = %error, "dispatch failure for job no longer ready");
                }
            }
            EngineEvent::Polled { job, state } => self.on_polled(job, state, now, &mut out),
            EngineEvent::PollFailed { job, error } => {
                if self.is_active(&job) {
                    self.fail(&job, format!("lost contact with worker: {error}"), now, &mut out);
                }
            }
            EngineEvent::CancelAcknowledged { job, confirmed } => {
                self.cancelling.remove(&job);
                if confirmed && self.is_active(&job) {
                    let result = self.resolver.cancel_job(&job, OPERATOR_CANCEL);
                    self.apply(result, now, &mut out);
                } else if !confirmed {
                    info!(job = %job, "remote cancel not confirmed; polling until terminal");
                }
            }
        }

        self.finish(out)
    }

    /// Operator cancel of the whole flow.
    ///
    /// Undispatched jobs are cancelled at once; active jobs get a remote
    /// cancel and stay active until the backend confirms or reports a
    /// terminal state.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> CoreStep {
        self.cancel_requested = true;
        let mut out = CoreStep::default();

        let step = self.resolver.cancel_undispatched(OPERATOR_CANCEL);
        self.apply(Ok(step), now, &mut out);

        let targets: Vec<RemoteJobRef> = self
            .active_jobs()
            .into_iter()
            .filter(|r| self.cancelling.insert(r.job.clone()))
            .collect();
        if !targets.is_empty() {
            info!(flow = %self.flow_id, jobs = targets.len(), "requesting remote cancel");
            out.commands.push(EngineCommand::CancelRemote(targets));
        }

        self.finish(out)
    }

    /// Operator requeue of one `Failed` job.
    pub fn requeue(&mut self, job: &str, now: DateTime<Utc>) -> Result<CoreStep> {
        let step = self.resolver.requeue(job)?;
        self.records.remove(job);
        let mut out = CoreStep::default();
        self.apply(Ok(step), now, &mut out);
        Ok(self.finish(out))
    }

    /// Load recorded job states into a fresh run.
    ///
    /// Jobs are restored in declaration order; jobs never mentioned in the
    /// log stay `Pending`.
    pub fn restore(&mut self, replayed: &ReplayedFlow) -> Result<()> {
        for id in self.resolver.graph().jobs().map(str::to_string).collect::<Vec<_>>() {
            if let Some(job) = replayed.jobs.get(&id) {
                self.resolver
                    .restore(&id, job.status, job.reason.clone(), job.outputs.clone())?;
            }
        }
        self.records = replayed.records.clone();
        info!(
            flow = %self.flow_id,
            restored = replayed.jobs.len(),
            records = self.records.len(),
            "flow run restored from log"
        );
        Ok(())
    }

    /// First step after [`FlowRun::restore`]: poll every active job at once,
    /// dispatch `Ready` jobs that never reached a worker, and promote any
    /// `Pending` job whose producers completed.
    pub fn resume_step(&mut self, now: DateTime<Utc>) -> CoreStep {
        let mut out = self.poll_step();

        // Restored `Ready` jobs produce no transition this time.
        let restored: Vec<ReadyJob> = self
            .resolver
            .jobs_with_status(JobStatus::Ready)
            .iter()
            .filter(|id| !self.records.contains_key(*id))
            .filter_map(|id| self.resolver.resolved_arguments(id))
            .collect();
        let mut step: ResolverStep = self.resolver.collect_ready();
        step.newly_ready.splice(0..0, restored);

        self.absorb(step, now, &mut out);
        self.finish(out)
    }

    fn is_active(&self, job: &str) -> bool {
        self.resolver.status_of(job).is_some_and(JobStatus::is_active)
    }

    fn fail(&mut self, job: &str, reason: String, now: DateTime<Utc>, out: &mut CoreStep) {
        let result = self.resolver.handle_failure(job, reason);
        self.apply(result, now, out);
    }

    fn on_dispatched(&mut self, job: JobId, handle: RemoteHandle, now: DateTime<Utc>, out: &mut CoreStep) {
        self.in_flight.remove(&job);
        let Some(plan) = self.plans.get(&job) else {
            warn!(job = %job, "dispatch acknowledged for unknown job");
            return;
        };
        let worker = plan.worker.clone();
        let resources = plan.directive.resources.clone();

        match self.resolver.status_of(&job) {
            Some(JobStatus::Ready) => {
                let step = match self.resolver.mark_submitted(&job) {
                    Ok(step) => step,
                    Err(e) => {
                        warn!(job = %job, error = %e, "could not mark job submitted");
                        return;
                    }
                };
                for change in &step.transitions {
                    let mut record = TransitionRecord::new(&self.flow_id, change, now);
                    if change.job == job && change.to == JobStatus::Submitted {
                        record.worker = Some(worker.clone());
                        record.resources = Some(resources.clone());
                        record.remote_handle = Some(handle.clone());
                        if let Some(sub) = SubmissionRecord::from_dispatch(&record) {
                            self.records.insert(job.clone(), sub);
                        }
                    }
                    out.log.push(LogEntry::Transition(record));
                }
                info!(flow = %self.flow_id, job = %job, handle = %handle, worker = %worker, "job submitted");
            }
            Some(JobStatus::Cancelled) => {
                // Cancelled while the dispatch was in flight.
                info!(job = %job, handle = %handle, "job cancelled during dispatch; cancelling remotely");
                self.cancelling.insert(job.clone());
                out.commands.push(EngineCommand::CancelRemote(vec![RemoteJobRef {
                    job,
                    worker,
                    handle,
                }]));
            }
            other => {
                warn!(job = %job, status = ?other, "unexpected dispatch acknowledgement");
            }
        }
    }

    fn on_polled(&mut self, job: JobId, state: RemoteState, now: DateTime<Utc>, out: &mut CoreStep) {
        let Some(status) = self.resolver.status_of(&job) else {
            warn!(job = %job, "poll result for unknown job");
            return;
        };
        if !status.is_active() {
            debug!(job = %job, %status, "ignoring poll result for inactive job");
            return;
        }

        match state {
            RemoteState::Queued => {}
            RemoteState::Running => {
                if status == JobStatus::Submitted {
                    let result = self.resolver.mark_running(&job);
                    self.apply(result, now, out);
                }
            }
            RemoteState::Completed { outputs } => {
                let result = self.resolver.handle_completion(&job, outputs);
                self.apply(result, now, out);
            }
            RemoteState::Failed { diagnostic } => {
                let err = RemoteflowError::RemoteExecution {
                    job: job.clone(),
                    diagnostic,
                };
                self.fail(&job, err.to_string(), now, out);
            }
            RemoteState::Cancelled => {
                self.cancelling.remove(&job);
                let reason = if self.cancel_requested {
                    OPERATOR_CANCEL
                } else {
                    "cancelled by the remote scheduler"
                };
                let result = self.resolver.cancel_job(&job, reason);
                self.apply(result, now, out);
            }
        }
    }

    /// Log the transitions of a resolver step and dispatch what became ready.
    fn apply(&mut self, result: Result<ResolverStep>, now: DateTime<Utc>, out: &mut CoreStep) {
        match result {
            Ok(step) => self.absorb(step, now, out),
            Err(e) => warn!(flow = %self.flow_id, error = %e, "rejected job transition"),
        }
    }

    fn absorb(&mut self, step: ResolverStep, now: DateTime<Utc>, out: &mut CoreStep) {
        for change in &step.transitions {
            let mut record = TransitionRecord::new(&self.flow_id, change, now);
            if change.to == JobStatus::Completed {
                record.outputs = self.resolver.outputs_of(&change.job).cloned();
            }
            if let Some(sub) = self.records.get_mut(&change.job) {
                sub.apply(change.clone(), now);
            }
            out.log.push(LogEntry::Transition(record));
        }

        let orders = self.dispatch_orders(step.newly_ready, now, out);
        if !orders.is_empty() {
            out.commands.push(EngineCommand::Dispatch(orders));
        }
    }

    fn dispatch_orders(&mut self, ready: Vec<ReadyJob>, now: DateTime<Utc>, out: &mut CoreStep) -> Vec<DispatchOrder> {
        let mut orders = Vec::new();

        for job in ready {
            if self.cancel_requested
                || self.in_flight.contains(&job.id)
                || self.resolver.status_of(&job.id) != Some(JobStatus::Ready)
            {
                continue;
            }
            let Some(plan) = self.plans.get(&job.id) else {
                continue;
            };

            let payload = JobPayload::from_ready(&self.flow_id, &job);
            let script = match plan.render(&payload) {
                Ok(script) => script,
                Err(e) => {
                    let result = self.resolver.handle_failure(&job.id, format!("rendering script: {e}"));
                    if let Ok(step) = result {
                        for change in &step.transitions {
                            out.log
                                .push(LogEntry::Transition(TransitionRecord::new(&self.flow_id, change, now)));
                        }
                    }
                    continue;
                }
            };

            self.in_flight.insert(job.id.clone());
            orders.push(DispatchOrder {
                job: job.id.clone(),
                worker: plan.worker.clone(),
                request: DispatchRequest {
                    flow_id: self.flow_id.clone(),
                    job_id: job.id.clone(),
                    worker: plan.worker.clone(),
                    directive: plan.directive.clone(),
                    payload,
                    script,
                },
            });
        }

        orders
    }

    fn finish(&self, mut out: CoreStep) -> CoreStep {
        out.finished = self.is_finished();
        out
    }
}
