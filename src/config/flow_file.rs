// src/config/flow_file.rs

//! Flows described in TOML.
//!
//! ```toml
//! [flow]
//! name = "add-chain"
//! worker = "local_shell"
//! metadata = { test = "add" }
//!
//! [[job]]
//! id = "a"
//! callable = "examples.add"
//! args = [1, 2]
//!
//! [[job]]
//! id = "b"
//! callable = "examples.add"
//! args = [{ ref = "a" }, 3]
//! ```
//!
//! A table with a `ref` key (and optional `slot`, default `"output"`) is a
//! reference to another job's output; every other value is a literal.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::config::model::RawResources;
use crate::errors::Result;
use crate::flow::{Argument, DEFAULT_SLOT, Flow, JobNode, OutputReference};
use crate::resources::ResourceSpec;

#[derive(Debug, Clone, Deserialize)]
pub struct RawFlowFile {
    pub flow: FlowSection,

    #[serde(default, rename = "job")]
    pub jobs: Vec<JobSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowSection {
    pub name: String,

    #[serde(default)]
    pub id: Option<String>,

    /// Worker used for jobs without their own `worker`.
    #[serde(default)]
    pub worker: Option<String>,

    #[serde(default)]
    pub exec_config: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Submission-level resource request.
    #[serde(default)]
    pub resources: RawResources,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSection {
    pub id: String,
    pub callable: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub args: Vec<ArgSection>,

    #[serde(default)]
    pub kwargs: BTreeMap<String, ArgSection>,

    #[serde(default)]
    pub outputs: Option<Vec<String>>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub worker: Option<String>,

    #[serde(default)]
    pub resources: Option<RawResources>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgSection {
    Reference(RefSection),
    Literal(toml::Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefSection {
    #[serde(rename = "ref")]
    pub producer: String,

    #[serde(default = "default_slot")]
    pub slot: String,
}

fn default_slot() -> String {
    DEFAULT_SLOT.to_string()
}

impl ArgSection {
    fn into_argument(self) -> Result<Argument> {
        Ok(match self {
            ArgSection::Reference(r) => Argument::Pending(OutputReference::new(r.producer, r.slot)),
            ArgSection::Literal(v) => Argument::Concrete(serde_json::to_value(v)?),
        })
    }
}

/// A flow plus the submission parameters its file carries.
#[derive(Debug, Clone)]
pub struct LoadedFlow {
    pub flow: Flow,
    pub worker: Option<String>,
    pub exec_config: Option<String>,
    pub resources: ResourceSpec,
}

impl TryFrom<RawFlowFile> for LoadedFlow {
    type Error = crate::errors::RemoteflowError;

    fn try_from(raw: RawFlowFile) -> std::result::Result<Self, Self::Error> {
        let mut flow = Flow::new(raw.flow.name);
        if let Some(id) = raw.flow.id {
            flow = flow.with_id(id);
        }

        for section in raw.jobs {
            let job = build_job(section)?;
            flow.add_job(job)?;
        }
        flow.update_metadata(raw.flow.metadata);
        flow.validate()?;

        Ok(LoadedFlow {
            flow,
            worker: raw.flow.worker,
            exec_config: raw.flow.exec_config,
            resources: ResourceSpec::try_from(&raw.flow.resources)?,
        })
    }
}

fn build_job(section: JobSection) -> Result<JobNode> {
    let mut job = JobNode::new(section.callable)
        .with_id(section.id)
        .with_priority(section.priority);

    if let Some(name) = section.name {
        job = job.with_name(name);
    }
    if let Some(outputs) = section.outputs {
        job = job.with_outputs(outputs);
    }
    if let Some(worker) = section.worker {
        job = job.on_worker(worker);
    }
    if let Some(resources) = &section.resources {
        job = job.with_resources(ResourceSpec::try_from(resources)?);
    }
    for arg in section.args {
        job.args.push(arg.into_argument()?);
    }
    for (key, arg) in section.kwargs {
        job.kwargs.insert(key, arg.into_argument()?);
    }
    job.update_metadata(&section.metadata);
    Ok(job)
}
