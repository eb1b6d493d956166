// src/flow/flow.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{RemoteflowError, Result};
use crate::flow::job::JobNode;
use crate::flow::validate::validate_flow;
use crate::types::{FlowId, JobId};

/// A member of a flow: a job, or a nested flow that is flattened before
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowItem {
    Job(JobNode),
    Flow(Flow),
}

/// An ordered collection of jobs whose references form a DAG.
///
/// Declaration order matters: it breaks ties between jobs that become ready
/// at the same time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    items: Vec<FlowItem>,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            metadata: BTreeMap::new(),
            items: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<FlowId>) -> Self {
        self.id = id.into();
        self
    }

    /// Build a flow from jobs in the given order.
    pub fn from_jobs(name: impl Into<String>, jobs: impl IntoIterator<Item = JobNode>) -> Result<Self> {
        let mut flow = Flow::new(name);
        for job in jobs {
            flow.add_job(job)?;
        }
        Ok(flow)
    }

    /// Append a job. Fails if its id is already used anywhere in this flow,
    /// nested flows included.
    pub fn add_job(&mut self, node: JobNode) -> Result<()> {
        if self.contains_job(&node.id) {
            return Err(RemoteflowError::DuplicateId(node.id));
        }
        debug!(flow = %self.name, job = %node.id, "adding job to flow");
        self.items.push(FlowItem::Job(node));
        Ok(())
    }

    /// Embed another flow. Its jobs keep their ids, so references across the
    /// boundary keep working after flattening.
    pub fn add_flow(&mut self, sub: Flow) -> Result<()> {
        for job in sub.jobs() {
            if self.contains_job(&job.id) {
                return Err(RemoteflowError::DuplicateId(job.id.clone()));
            }
        }
        debug!(flow = %self.name, sub_flow = %sub.name, "embedding sub-flow");
        self.items.push(FlowItem::Flow(sub));
        Ok(())
    }

    pub fn items(&self) -> &[FlowItem] {
        &self.items
    }

    /// All jobs, depth-first in declaration order.
    pub fn jobs(&self) -> Vec<&JobNode> {
        let mut out = Vec::new();
        collect_jobs(&self.items, &mut out);
        out
    }

    /// Owned copy of [`Flow::jobs`].
    pub fn flatten(&self) -> Vec<JobNode> {
        self.jobs().into_iter().cloned().collect()
    }

    pub fn job(&self, id: &str) -> Option<&JobNode> {
        self.jobs().into_iter().find(|j| j.id == id)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs().into_iter().map(|j| j.id.clone()).collect()
    }

    pub fn contains_job(&self, id: &str) -> bool {
        self.jobs().iter().any(|j| j.id == id)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge tags into this flow and into every job it contains. Existing
    /// keys are overwritten, other keys are kept.
    pub fn update_metadata<I, K, V>(&mut self, tags: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let tags: BTreeMap<String, String> = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.apply_metadata(&tags);
    }

    fn apply_metadata(&mut self, tags: &BTreeMap<String, String>) {
        for (k, v) in tags {
            self.metadata.insert(k.clone(), v.clone());
        }
        for item in self.items.iter_mut() {
            match item {
                FlowItem::Job(job) => job.update_metadata(tags),
                FlowItem::Flow(sub) => sub.apply_metadata(tags),
            }
        }
    }

    /// Check ids, references and acyclicity. See [`validate_flow`].
    pub fn validate(&self) -> Result<()> {
        validate_flow(self)
    }
}

fn collect_jobs<'a>(items: &'a [FlowItem], out: &mut Vec<&'a JobNode>) {
    for item in items {
        match item {
            FlowItem::Job(job) => out.push(job),
            FlowItem::Flow(sub) => collect_jobs(&sub.items, out),
        }
    }
}
