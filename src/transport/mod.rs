// src/transport/mod.rs

//! Remote execution backends.
//!
//! The engine talks to a [`RemoteTransport`] instead of spawning processes
//! or calling scheduler commands directly. This keeps the submission logic
//! independent of how a worker is reached and lets tests plug in a scripted
//! fake.
//!
//! - [`shell::ShellTransport`] runs scripts through `sh -s`, locally or over
//!   `ssh`, and tracks the processes itself.
//! - [`slurm::SlurmTransport`] submits with `sbatch`, polls with `sacct` and
//!   cancels with `scancel`.
//! - [`retry`] wraps any call in a per-call timeout plus bounded retries.

pub mod command;
pub mod retry;
pub mod shell;
pub mod slurm;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::ReadyJob;
use crate::errors::Result;
use crate::flow::{Argument, DEFAULT_SLOT, JobNode, OutputMap};
use crate::resources::WorkerProfile;
use crate::translate::Directive;
use crate::types::{FlowId, JobId, SchedulerFamily};

pub use retry::{RetryPolicy, with_retry, with_retry_at_most_once};
pub use shell::ShellTransport;
pub use slurm::SlurmTransport;

/// Backend-assigned identifier of a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHandle {
    pub id: String,
    /// Per-job directory on the worker, when the backend uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_dir: Option<PathBuf>,
}

impl RemoteHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job_dir: None,
        }
    }

    pub fn with_job_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.job_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// What the backend reports for a dispatched job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemoteState {
    Queued,
    Running,
    Completed { outputs: OutputMap },
    Failed { diagnostic: String },
    Cancelled,
}

impl RemoteState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteState::Completed { .. } | RemoteState::Failed { .. } | RemoteState::Cancelled
        )
    }
}

/// Input handed to the remote runner, serialized as JSON into the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub flow_id: FlowId,
    pub job_id: JobId,
    pub name: String,
    pub callable: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub outputs: Vec<String>,
}

impl JobPayload {
    pub fn from_ready(flow_id: &str, job: &ReadyJob) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            job_id: job.id.clone(),
            name: job.name.clone(),
            callable: job.callable.clone(),
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
            outputs: job.outputs.clone(),
        }
    }

    /// Payload of a job whose inputs may still be pending, with references
    /// shown as `{"ref": ..., "slot": ...}`. Used for dry runs.
    pub fn preview(flow_id: &str, job: &JobNode) -> Self {
        let show = |arg: &Argument| match arg {
            Argument::Concrete(v) => v.clone(),
            Argument::Pending(r) => serde_json::json!({ "ref": r.producer, "slot": r.slot }),
        };
        Self {
            flow_id: flow_id.to_string(),
            job_id: job.id.clone(),
            name: job.name.clone(),
            callable: job.callable.clone(),
            args: job.args.iter().map(show).collect(),
            kwargs: job.kwargs.iter().map(|(k, a)| (k.clone(), show(a))).collect(),
            outputs: job.outputs.clone(),
        }
    }
}

/// Everything a transport needs to start one job.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub flow_id: FlowId,
    pub job_id: JobId,
    pub worker: String,
    pub directive: Directive,
    pub payload: JobPayload,
    /// Rendered submission script.
    pub script: String,
}

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Capability interface to a remote execution backend.
///
/// Errors of kind `Transport` are considered transient and retried by the
/// engine; any other error is final for the job concerned.
pub trait RemoteTransport: Send + Sync {
    /// Start a job and return its handle.
    fn dispatch<'a>(&'a self, request: &'a DispatchRequest) -> TransportFuture<'a, RemoteHandle>;

    /// Current state of a dispatched job.
    fn poll<'a>(&'a self, handle: &'a RemoteHandle) -> TransportFuture<'a, RemoteState>;

    /// Best-effort cancellation. `true` when the backend confirmed it.
    fn cancel<'a>(&'a self, handle: &'a RemoteHandle) -> TransportFuture<'a, bool>;
}

/// Default transport for a worker profile, chosen by scheduler family.
pub fn transport_for(worker: &WorkerProfile) -> Arc<dyn RemoteTransport> {
    match worker.family {
        SchedulerFamily::BatchQueue => Arc::new(SlurmTransport::new(
            worker.ssh_target(),
            worker.work_dir.clone(),
        )),
        SchedulerFamily::InteractiveShell | SchedulerFamily::Local => Arc::new(
            ShellTransport::new(worker.ssh_target(), worker.work_dir.clone()),
        ),
    }
}

/// Outputs from a runner's stdout.
///
/// The last non-empty line is expected to be a JSON object of slot values.
/// Any other JSON value is published under the default slot; non-JSON output
/// publishes the trimmed text under the default slot.
pub fn parse_outputs(stdout: &str) -> OutputMap {
    let last = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");

    match serde_json::from_str::<Value>(last) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        Ok(other) => OutputMap::from([(DEFAULT_SLOT.to_string(), other)]),
        Err(_) => OutputMap::from([(
            DEFAULT_SLOT.to_string(),
            Value::String(stdout.trim().to_string()),
        )]),
    }
}

/// Last `n` lines of `text`, for diagnostics.
pub(crate) fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
