// src/dag/resolver_step.rs

//! Result type for a single resolver step.

use crate::dag::job_info::{ReadyJob, StatusChange};
use crate::types::JobId;

/// What changed during one resolver call.
///
/// Tests use this to step a flow by hand and assert on each change.
#[derive(Debug, Clone, Default)]
pub struct ResolverStep {
    /// Jobs that moved from `Pending` to `Ready`, in dispatch order.
    pub newly_ready: Vec<ReadyJob>,
    /// Jobs that moved to `Cancelled`.
    pub newly_cancelled: Vec<JobId>,
    /// Every transition applied, in order.
    pub transitions: Vec<StatusChange>,
    /// Whether this step moved the last job into a terminal state.
    pub flow_just_finished: bool,
}

impl ResolverStep {
    pub(crate) fn ready(newly_ready: Vec<ReadyJob>) -> Self {
        Self {
            newly_ready,
            ..Self::default()
        }
    }

    pub(crate) fn cancelled(newly_cancelled: Vec<JobId>) -> Self {
        Self {
            newly_cancelled,
            ..Self::default()
        }
    }

    pub fn ready_ids(&self) -> Vec<&str> {
        self.newly_ready.iter().map(|j| j.id.as_str()).collect()
    }
}
