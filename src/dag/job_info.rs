// src/dag/job_info.rs

//! Per-job resolution state and the types handed to the engine.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::{JobNode, OutputMap};
use crate::types::{JobId, JobStatus};

/// Static job definition plus its current status.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub node: JobNode,
    /// Direct producers (from the job's references).
    pub deps: Vec<JobId>,
    pub status: JobStatus,
    /// Why the job is in its current state, for `Failed` and `Cancelled`.
    pub reason: Option<String>,
}

impl JobInfo {
    pub fn new(node: JobNode) -> Self {
        let deps = node.producers();
        Self {
            node,
            deps,
            status: JobStatus::Pending,
            reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.node.id
    }
}

/// A job whose inputs are all available, with references replaced by the
/// published values.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyJob {
    pub id: JobId,
    pub name: String,
    pub callable: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub outputs: Vec<String>,
    pub priority: i32,
}

impl ReadyJob {
    /// Resolve every argument of `info`; `None` if any is still missing.
    pub fn resolve(info: &JobInfo, published: &HashMap<JobId, OutputMap>) -> Option<Self> {
        let node = &info.node;
        let args = node
            .args
            .iter()
            .map(|a| a.resolve(published))
            .collect::<Option<Vec<_>>>()?;
        let kwargs = node
            .kwargs
            .iter()
            .map(|(k, a)| a.resolve(published).map(|v| (k.clone(), v)))
            .collect::<Option<BTreeMap<_, _>>>()?;

        Some(Self {
            id: node.id.clone(),
            name: node.name.clone(),
            callable: node.callable.clone(),
            args,
            kwargs,
            outputs: node.outputs.clone(),
            priority: node.priority,
        })
    }
}

/// One status change produced by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub job: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Read-only view of a job's state, for snapshots and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobState {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&JobInfo> for JobState {
    fn from(info: &JobInfo) -> Self {
        Self {
            id: info.node.id.clone(),
            name: info.node.name.clone(),
            status: info.status,
            reason: info.reason.clone(),
        }
    }
}
