// src/resources/worker.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::resources::spec::ResourceSpec;
use crate::types::SchedulerFamily;

/// Command used on the worker to run a payload when the profile does not
/// override it. `{callable}` is replaced with the job's callable handle.
pub const DEFAULT_RUNNER: &str = "remoteflow-exec {callable}";

/// A named remote execution target.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerProfile {
    pub name: String,
    pub family: SchedulerFamily,
    /// Host to reach over ssh; `None` means this machine.
    pub host: Option<String>,
    pub user: Option<String>,
    /// Directory on the worker under which per-job directories are created.
    pub work_dir: PathBuf,
    /// Payload command template.
    pub runner: String,
    /// Used for every field a submission leaves unset.
    pub default_resources: ResourceSpec,
    pub default_exec_config: Option<String>,
}

impl WorkerProfile {
    pub fn new(name: impl Into<String>, family: SchedulerFamily) -> Self {
        Self {
            name: name.into(),
            family,
            host: None,
            user: None,
            work_dir: PathBuf::from("."),
            runner: DEFAULT_RUNNER.to_string(),
            default_resources: ResourceSpec::default(),
            default_exec_config: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }

    pub fn with_default_resources(mut self, resources: ResourceSpec) -> Self {
        self.default_resources = resources;
        self
    }

    pub fn with_default_exec_config(mut self, name: impl Into<String>) -> Self {
        self.default_exec_config = Some(name.into());
        self
    }

    /// `user@host` (or just `host`) when the worker is remote.
    pub fn ssh_target(&self) -> Option<String> {
        let host = self.host.as_ref()?;
        Some(match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.clone(),
        })
    }

    /// Runner command line for a given callable.
    pub fn runner_command(&self, callable: &str) -> String {
        expand_runner(&self.runner, callable)
    }
}

/// A pre-provisioned execution environment on a worker (toolchain modules,
/// environment variables, setup commands).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecConfig {
    pub name: String,
    pub modules: Vec<String>,
    pub export: BTreeMap<String, String>,
    pub pre_run: Vec<String>,
    pub post_run: Vec<String>,
}

impl ExecConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Shell lines run before the payload command.
    pub fn setup_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.modules.is_empty() {
            lines.push("module purge".to_string());
            for module in &self.modules {
                lines.push(format!("module load {module}"));
            }
        }
        for (key, value) in &self.export {
            lines.push(format!("export {key}={}", shell_quote(value)));
        }
        lines.extend(self.pre_run.iter().cloned());
        lines
    }
}

/// Single-quote a value for POSIX shells.
/// `template` with `{callable}` replaced by the shell-quoted callable.
pub(crate) fn expand_runner(template: &str, callable: &str) -> String {
    template.replace("{callable}", &shell_quote(callable))
}

pub(crate) fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
