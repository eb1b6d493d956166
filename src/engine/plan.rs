// src/engine/plan.rs

//! Per-job submission plans, computed once for a whole flow before anything
//! is dispatched.

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::{RemoteflowError, Result};
use crate::flow::Flow;
use crate::resources::worker::expand_runner;
use crate::resources::{ExecConfig, ResourceSpec, WorkerProfile};
use crate::translate::{Directive, translate};
use crate::transport::JobPayload;
use crate::types::JobId;

/// Where and how one job runs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    pub worker: String,
    pub directive: Directive,
    pub exec_config: Option<ExecConfig>,
    /// Runner template of the worker (`{callable}` placeholder).
    pub runner: String,
}

impl JobPlan {
    pub fn runner_for(&self, callable: &str) -> String {
        expand_runner(&self.runner, callable)
    }

    /// Submission script for `payload`.
    pub fn render(&self, payload: &JobPayload) -> Result<String> {
        self.directive.render_script(
            payload,
            &self.runner_for(&payload.callable),
            self.exec_config.as_ref(),
        )
    }
}

/// Plan every job of `flow`.
///
/// For each job:
/// - the worker is the job's override, else `worker` (`UnknownWorker`),
/// - the environment is `exec_config`, else the worker's default
///   (`UnknownExecConfig`),
/// - the request is the job's override merged over `resources`, then
///   translated for the worker (translation errors).
///
/// The first error aborts the whole plan, so a flow with one bad job is
/// rejected before any job runs.
pub fn plan_flow(
    flow: &Flow,
    worker: &str,
    resources: &ResourceSpec,
    exec_config: Option<&str>,
    workers: &BTreeMap<String, WorkerProfile>,
    exec_configs: &BTreeMap<String, ExecConfig>,
) -> Result<BTreeMap<JobId, JobPlan>> {
    let mut plans = BTreeMap::new();

    for job in flow.jobs() {
        let worker_name = job.worker.as_deref().unwrap_or(worker);
        let profile = workers
            .get(worker_name)
            .ok_or_else(|| RemoteflowError::UnknownWorker(worker_name.to_string()))?;

        let env = match exec_config.or(profile.default_exec_config.as_deref()) {
            Some(name) => Some(
                exec_configs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RemoteflowError::UnknownExecConfig(name.to_string()))?,
            ),
            None => None,
        };

        let request = match &job.resources {
            Some(own) => own.merged_over(resources),
            None => resources.clone(),
        };
        let directive = translate(&request, profile)?;

        debug!(
            job = %job.id,
            worker = %worker_name,
            exec_config = ?env.as_ref().map(|e| e.name.as_str()),
            "job planned"
        );

        plans.insert(
            job.id.clone(),
            JobPlan {
                worker: worker_name.to_string(),
                directive,
                exec_config: env,
                runner: profile.runner.clone(),
            },
        );
    }

    Ok(plans)
}
