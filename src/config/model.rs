// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::resources::{ExecConfig, WorkerProfile};
use crate::transport::RetryPolicy;
use crate::types::SchedulerFamily;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// poll_interval = "5s"
/// state_file = ".remoteflow/transitions.jsonl"
///
/// [engine.retry]
/// max_attempts = 3
///
/// [worker.local_slurm]
/// scheduler = "batch_queue"
/// work_dir = "/scratch/flows"
/// default_exec_config = "qe"
///
/// [worker.local_slurm.resources]
/// nodes = 1
/// time = "00:20:00"
/// partition = "debug"
///
/// [exec_config.qe]
/// modules = ["qe/7.2"]
/// export = { OMP_PROC_BIND = "close" }
/// ```
///
/// Every section is optional at parse time; [`ConfigFile`]'s `TryFrom`
/// conversion enforces the semantic rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: RawEngineSection,

    /// Keys are worker names.
    #[serde(default)]
    pub worker: BTreeMap<String, WorkerConfig>,

    /// Keys are execution environment names.
    #[serde(default)]
    pub exec_config: BTreeMap<String, ExecConfigSection>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEngineSection {
    /// How often active jobs are polled (`"5s"`, `"500ms"`).
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// JSON-lines transition log.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    #[serde(default)]
    pub retry: RawRetrySection,
}

fn default_poll_interval() -> String {
    "5s".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".remoteflow/transitions.jsonl")
}

impl Default for RawEngineSection {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            state_file: default_state_file(),
            retry: RawRetrySection::default(),
        }
    }
}

/// `[engine.retry]` section: transport call timeout and retry budget.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> String {
    "500ms".to_string()
}

fn default_max_backoff() -> String {
    "10s".to_string()
}

fn default_call_timeout() -> String {
    "30s".to_string()
}

impl Default for RawRetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            call_timeout: default_call_timeout(),
        }
    }
}

/// `[worker.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// `"batch_queue"` (alias `"slurm"`), `"shell"` or `"local"`.
    #[serde(default)]
    pub scheduler: SchedulerFamily,

    /// ssh host; omit for this machine.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Payload command template; `{callable}` is substituted.
    #[serde(default)]
    pub runner: Option<String>,

    #[serde(default)]
    pub default_exec_config: Option<String>,

    /// Default resources for jobs sent to this worker.
    #[serde(default)]
    pub resources: RawResources,
}

/// Resource table as written in TOML.
///
/// Known keys map to modeled fields; any other key is kept as an opaque
/// extension and passed to the scheduler verbatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawResources {
    #[serde(default)]
    pub nodes: Option<u32>,

    #[serde(default, alias = "tasks")]
    pub ntasks: Option<u32>,

    #[serde(default, alias = "cpus-per-task")]
    pub cpus_per_task: Option<u32>,

    /// Slurm time format (`"00:20:00"`, `"1-00:00:00"`, `"30"`).
    #[serde(default, alias = "walltime")]
    pub time: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// `[exec_config.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecConfigSection {
    #[serde(default)]
    pub modules: Vec<String>,

    #[serde(default)]
    pub export: BTreeMap<String, String>,

    #[serde(default)]
    pub pre_run: Vec<String>,

    #[serde(default)]
    pub post_run: Vec<String>,
}

/// Validated `[engine]` settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub state_file: PathBuf,
    pub retry: RetryPolicy,
}

/// Fully validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSettings,
    pub workers: BTreeMap<String, WorkerProfile>,
    pub exec_configs: BTreeMap<String, ExecConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        engine: EngineSettings,
        workers: BTreeMap<String, WorkerProfile>,
        exec_configs: BTreeMap<String, ExecConfig>,
    ) -> Self {
        Self {
            engine,
            workers,
            exec_configs,
        }
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerProfile> {
        self.workers.get(name)
    }

    /// The only worker, when exactly one is configured.
    pub fn sole_worker(&self) -> Option<&WorkerProfile> {
        match self.workers.len() {
            1 => self.workers.values().next(),
            _ => None,
        }
    }
}
