// src/translate/shell.rs

use crate::errors::{RemoteflowError, Result};
use crate::resources::{ResourceField, ResourceSpec};
use crate::translate::DirectiveTranslator;
use crate::types::SchedulerFamily;

/// Plain shell on a single host.
///
/// - `time` becomes a `timeout <secs>` wrapper around the payload command,
/// - `cpus_per_task` becomes `OMP_NUM_THREADS`,
/// - extensions named like variables are exported, the others are kept
///   verbatim as `# key=value` comments,
/// - `tasks` has no shell equivalent and is left to the runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellTranslator;

impl DirectiveTranslator for ShellTranslator {
    fn family(&self) -> SchedulerFamily {
        SchedulerFamily::InteractiveShell
    }

    fn check_supported(&self, spec: &ResourceSpec) -> Result<()> {
        check_single_host(spec, self.family())
    }

    fn render_lines(&self, spec: &ResourceSpec) -> Vec<String> {
        export_lines(spec)
    }

    fn job_name_line(&self, name: &str) -> Option<String> {
        Some(format!("# remoteflow job: {name}"))
    }

    fn wrap_command(&self, command: String, spec: &ResourceSpec) -> String {
        match spec.time {
            Some(t) => format!("timeout {} {command}", t.as_secs()),
            None => command,
        }
    }
}

/// Shared by the shell and local families: one host only.
pub(crate) fn check_single_host(spec: &ResourceSpec, family: SchedulerFamily) -> Result<()> {
    if let Some(n) = spec.nodes.filter(|n| *n > 1) {
        return Err(RemoteflowError::UnsupportedResourceField {
            field: ResourceField::Nodes.to_string(),
            family,
            reason: format!("a single host cannot provide {n} nodes"),
        });
    }
    Ok(())
}

pub(crate) fn export_lines(spec: &ResourceSpec) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(n) = spec.cpus_per_task {
        lines.push(format!("export OMP_NUM_THREADS={n}"));
    }
    for (key, value) in &spec.extensions {
        if is_env_name(key) {
            lines.push(format!(
                "export {key}={}",
                crate::resources::worker::shell_quote(value)
            ));
        } else {
            let entry = format!("{key}={value}").replace(['\n', '\r'], " ");
            lines.push(format!("# {entry}"));
        }
    }
    lines
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
