// src/flow/job.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::value::{Argument, DEFAULT_SLOT, OutputReference};
use crate::resources::ResourceSpec;
use crate::types::JobId;

/// One deferred call: a callable handle plus its inputs.
///
/// The callable is opaque to this crate; only the worker's execution
/// environment knows how to turn it into something runnable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNode {
    pub id: JobId,
    pub name: String,
    pub callable: String,

    #[serde(default)]
    pub args: Vec<Argument>,

    #[serde(default)]
    pub kwargs: BTreeMap<String, Argument>,

    /// Declared output slots.
    pub outputs: Vec<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Among jobs that become ready together, higher goes first.
    #[serde(default)]
    pub priority: i32,

    /// Worker override; `None` uses the worker given at submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    /// Resource override, merged over the submission-level request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
}

impl JobNode {
    /// New job with a random id and the single default output slot.
    pub fn new(callable: impl Into<String>) -> Self {
        let callable = callable.into();
        let name = callable
            .rsplit(['.', ':'])
            .next()
            .unwrap_or(callable.as_str())
            .to_string();

        Self {
            id: Uuid::new_v4().to_string(),
            name,
            callable,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            outputs: vec![DEFAULT_SLOT.to_string()],
            metadata: BTreeMap::new(),
            priority: 0,
            worker: None,
            resources: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn arg(mut self, value: impl Into<Argument>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Argument>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_outputs<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = slots.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reference to this job's first declared output.
    pub fn output(&self) -> OutputReference {
        let slot = self
            .outputs
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_SLOT);
        OutputReference::new(self.id.clone(), slot)
    }

    /// Reference to a named output slot.
    pub fn output_slot(&self, slot: impl Into<String>) -> OutputReference {
        OutputReference::new(self.id.clone(), slot)
    }

    pub fn declares_output(&self, slot: &str) -> bool {
        self.outputs.iter().any(|s| s == slot)
    }

    /// Every reference among the inputs, positional first.
    pub fn references(&self) -> impl Iterator<Item = &OutputReference> {
        self.args
            .iter()
            .chain(self.kwargs.values())
            .filter_map(Argument::reference)
    }

    /// Distinct producer ids in first-use order.
    pub fn producers(&self) -> Vec<JobId> {
        let mut seen = Vec::new();
        for r in self.references() {
            if !seen.contains(&r.producer) {
                seen.push(r.producer.clone());
            }
        }
        seen
    }

    pub fn update_metadata(&mut self, tags: &BTreeMap<String, String>) {
        for (k, v) in tags {
            self.metadata.insert(k.clone(), v.clone());
        }
    }
}
