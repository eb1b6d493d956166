// src/store/records.rs

//! Log entries and the records rebuilt from them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::StatusChange;
use crate::errors::{RemoteflowError, Result};
use crate::flow::{Flow, OutputMap};
use crate::resources::ResourceSpec;
use crate::transport::RemoteHandle;
use crate::types::{FlowId, JobId, JobStatus};

/// One line of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    /// A flow was accepted. Carries everything needed to rebuild its run.
    FlowSubmitted {
        flow_id: FlowId,
        flow: Flow,
        worker: String,
        #[serde(default)]
        resources: ResourceSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_config: Option<String>,
        at: DateTime<Utc>,
    },
    Transition(TransitionRecord),
    /// Everything logged for the flow before this entry is void.
    Purged { flow_id: FlowId, at: DateTime<Utc> },
}

impl LogEntry {
    pub fn flow_id(&self) -> &str {
        match self {
            LogEntry::FlowSubmitted { flow_id, .. } => flow_id,
            LogEntry::Transition(t) => &t.flow_id,
            LogEntry::Purged { flow_id, .. } => flow_id,
        }
    }
}

/// A persisted job status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub flow_id: FlowId,
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set on the `Submitted` transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_handle: Option<RemoteHandle>,
    /// Set on the `Completed` transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<OutputMap>,
    pub at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn new(flow_id: &str, change: &StatusChange, at: DateTime<Utc>) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            job_id: change.job.clone(),
            from: change.from,
            to: change.to,
            reason: change.reason.clone(),
            worker: None,
            resources: None,
            remote_handle: None,
            outputs: None,
            at,
        }
    }

    pub fn change(&self) -> StatusChange {
        StatusChange {
            job: self.job_id.clone(),
            from: self.from,
            to: self.to,
            reason: self.reason.clone(),
        }
    }
}

/// Dispatch record of one job, created when it is handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub flow_id: FlowId,
    pub job_id: JobId,
    pub worker: String,
    /// Effective resources the job was submitted with.
    pub resources: ResourceSpec,
    pub remote_handle: RemoteHandle,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StatusChange>,
}

impl SubmissionRecord {
    /// Build from a `Submitted` transition carrying worker and handle.
    pub fn from_dispatch(record: &TransitionRecord) -> Option<Self> {
        Some(Self {
            flow_id: record.flow_id.clone(),
            job_id: record.job_id.clone(),
            worker: record.worker.clone()?,
            resources: record.resources.clone().unwrap_or_default(),
            remote_handle: record.remote_handle.clone()?,
            status: record.to,
            created_at: record.at,
            updated_at: record.at,
            history: vec![record.change()],
        })
    }

    pub fn apply(&mut self, change: StatusChange, at: DateTime<Utc>) {
        self.status = change.to;
        self.updated_at = at;
        self.history.push(change);
    }
}

/// Last known state of one job in a replayed flow.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedJob {
    pub status: JobStatus,
    pub reason: Option<String>,
    pub outputs: Option<OutputMap>,
}

/// A flow rebuilt from its log entries.
#[derive(Debug, Clone)]
pub struct ReplayedFlow {
    pub flow: Flow,
    pub worker: String,
    pub resources: ResourceSpec,
    pub exec_config: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Jobs with at least one recorded transition.
    pub jobs: BTreeMap<JobId, ReplayedJob>,
    pub records: BTreeMap<JobId, SubmissionRecord>,
}

/// Rebuild the state of `flow_id` from its entries, in log order.
///
/// Entries up to and including the last `Purged` marker are ignored. Fails
/// with `UnknownSubmission` when no `FlowSubmitted` entry remains.
pub fn replay(flow_id: &str, entries: &[LogEntry]) -> Result<ReplayedFlow> {
    let own: Vec<&LogEntry> = entries.iter().filter(|e| e.flow_id() == flow_id).collect();
    let start = own
        .iter()
        .rposition(|e| matches!(e, LogEntry::Purged { .. }))
        .map(|i| i + 1)
        .unwrap_or(0);
    let live = own[start..].iter().copied();

    let mut replayed: Option<ReplayedFlow> = None;

    for entry in live {
        match entry {
            LogEntry::FlowSubmitted {
                flow,
                worker,
                resources,
                exec_config,
                at,
                ..
            } => {
                replayed = Some(ReplayedFlow {
                    flow: flow.clone(),
                    worker: worker.clone(),
                    resources: resources.clone(),
                    exec_config: exec_config.clone(),
                    submitted_at: *at,
                    jobs: BTreeMap::new(),
                    records: BTreeMap::new(),
                });
            }
            LogEntry::Transition(t) => {
                let Some(state) = replayed.as_mut() else {
                    continue;
                };
                apply_transition(state, t);
            }
            LogEntry::Purged { .. } => {}
        }
    }

    replayed.ok_or_else(|| RemoteflowError::UnknownSubmission(flow_id.to_string()))
}

fn apply_transition(state: &mut ReplayedFlow, t: &TransitionRecord) {
    let job = state
        .jobs
        .entry(t.job_id.clone())
        .or_insert_with(|| ReplayedJob {
            status: t.from,
            reason: None,
            outputs: None,
        });
    job.status = t.to;
    job.reason = t.reason.clone();
    if t.to == JobStatus::Pending {
        job.outputs = None;
    }
    if let Some(outputs) = &t.outputs {
        job.outputs = Some(outputs.clone());
    }

    if t.to == JobStatus::Submitted {
        if let Some(record) = SubmissionRecord::from_dispatch(t) {
            state.records.insert(t.job_id.clone(), record);
        }
    } else if let Some(record) = state.records.get_mut(&t.job_id) {
        record.apply(t.change(), t.at);
    }
}
