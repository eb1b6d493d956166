// src/dag/state_manager.rs

//! Status transitions for the jobs of one flow.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::dag::DagGraph;
use crate::dag::job_info::{JobInfo, ReadyJob, StatusChange};
use crate::errors::{RemoteflowError, Result};
use crate::flow::OutputMap;
use crate::types::{JobId, JobStatus};

/// Applies transitions to a flow's job map and records each one.
///
/// Every status change in the crate goes through [`StateManager::transition`],
/// which checks it against [`JobStatus::can_transition_to`].
pub struct StateManager<'a> {
    graph: &'a DagGraph,
    jobs: &'a mut HashMap<JobId, JobInfo>,
    published: &'a HashMap<JobId, OutputMap>,
    changes: Vec<StatusChange>,
}

impl<'a> StateManager<'a> {
    pub fn new(
        graph: &'a DagGraph,
        jobs: &'a mut HashMap<JobId, JobInfo>,
        published: &'a HashMap<JobId, OutputMap>,
    ) -> Self {
        Self {
            graph,
            jobs,
            published,
            changes: Vec::new(),
        }
    }

    /// Transitions applied so far.
    pub fn into_changes(self) -> Vec<StatusChange> {
        self.changes
    }

    pub fn transition(&mut self, job: &str, to: JobStatus, reason: Option<String>) -> Result<()> {
        let info = self
            .jobs
            .get_mut(job)
            .ok_or_else(|| RemoteflowError::UnknownJob(job.to_string()))?;

        let from = info.status;
        if !from.can_transition_to(to) {
            return Err(RemoteflowError::InvalidTransition {
                job: job.to_string(),
                from,
                to,
            });
        }

        debug!(job = %job, %from, %to, "job transition");
        info.status = to;
        info.reason = reason.clone();
        self.changes.push(StatusChange {
            job: job.to_string(),
            from,
            to,
            reason,
        });
        Ok(())
    }

    /// Every producer has completed and published its outputs.
    pub fn deps_satisfied(&self, info: &JobInfo) -> bool {
        info.deps.iter().all(|dep| match self.jobs.get(dep) {
            Some(d) => d.status == JobStatus::Completed && self.published.contains_key(dep),
            None => {
                warn!(job = %info.id(), dep = %dep, "dependency missing from job map");
                false
            }
        })
    }

    /// Move each `Pending` candidate whose inputs are available to `Ready`.
    ///
    /// Returned jobs are sorted by priority (highest first), then declaration
    /// order. A job is only ever returned by the call that moved it out of
    /// `Pending`.
    pub fn promote_ready<I, S>(&mut self, candidates: I) -> Vec<ReadyJob>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut ready: Vec<ReadyJob> = Vec::new();

        for candidate in candidates {
            let id = candidate.as_ref();
            if !seen.insert(id.to_string()) {
                continue;
            }
            let Some(info) = self.jobs.get(id) else {
                continue;
            };
            if info.status != JobStatus::Pending || !self.deps_satisfied(info) {
                continue;
            }
            let Some(job) = ReadyJob::resolve(info, self.published) else {
                warn!(job = %id, "producers completed but an input is still unresolved");
                continue;
            };
            ready.push(job);
        }

        ready.sort_by_key(|j| self.graph.dispatch_key(&j.id));

        for job in &ready {
            // Only Pending jobs were selected, so this cannot fail.
            if let Err(e) = self.transition(&job.id, JobStatus::Ready, None) {
                warn!(job = %job.id, error = %e, "could not mark job ready");
            } else {
                info!(job = %job.id, name = %job.name, "inputs resolved; job is ready");
            }
        }

        ready
    }

    /// Cancel every transitive dependent of `failed` that has not reached a
    /// terminal state. Returns the ids that changed.
    pub fn cancel_dependents(&mut self, failed: &str) -> Vec<JobId> {
        let dependents: Vec<JobId> = self
            .graph
            .transitive_dependents(failed)
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut cancelled = Vec::new();

        for id in dependents {
            let status = match self.jobs.get(&id) {
                Some(info) => info.status,
                None => continue,
            };
            if status.is_terminal() {
                continue;
            }
            if status.is_active() {
                // A consumer cannot be running before its producer finished.
                warn!(job = %id, %status, "dependent of failed job is already active");
                continue;
            }
            let reason = RemoteflowError::DependencyBlocked {
                job: id.clone(),
                dependency: failed.to_string(),
            };
            if self
                .transition(&id, JobStatus::Cancelled, Some(reason.to_string()))
                .is_ok()
            {
                cancelled.push(id);
            }
        }

        if !cancelled.is_empty() {
            warn!(
                job = %failed,
                cancelled = cancelled.len(),
                "cancelled dependents of failed job"
            );
        }
        cancelled
    }

    pub fn all_terminal(&self) -> bool {
        self.jobs.values().all(|info| info.status.is_terminal())
    }
}
