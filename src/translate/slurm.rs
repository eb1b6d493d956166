// src/translate/slurm.rs

use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{RemoteflowError, Result};
use crate::resources::{ResourceField, ResourceSpec};
use crate::translate::DirectiveTranslator;
use crate::types::SchedulerFamily;

const PREFIX: &str = "#SBATCH";

/// Slurm-style batch queue directives.
///
/// Modeled fields come first in a fixed order, then extensions in key order,
/// each passed through verbatim as `--key=value` (or `--key` when the value is
/// empty).
#[derive(Debug, Clone, Copy, Default)]
pub struct SlurmTranslator;

impl DirectiveTranslator for SlurmTranslator {
    fn family(&self) -> SchedulerFamily {
        SchedulerFamily::BatchQueue
    }

    fn required_fields(&self) -> &'static [ResourceField] {
        &[ResourceField::Time]
    }

    fn render_lines(&self, spec: &ResourceSpec) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(n) = spec.nodes {
            lines.push(format!("{PREFIX} --nodes={n}"));
        }
        if let Some(n) = spec.tasks {
            lines.push(format!("{PREFIX} --ntasks={n}"));
        }
        if let Some(n) = spec.cpus_per_task {
            lines.push(format!("{PREFIX} --cpus-per-task={n}"));
        }
        if let Some(t) = spec.time {
            lines.push(format!("{PREFIX} --time={t}"));
        }
        for (key, value) in &spec.extensions {
            if value.is_empty() {
                lines.push(format!("{PREFIX} --{key}"));
            } else {
                lines.push(format!("{PREFIX} --{key}={value}"));
            }
        }
        lines
    }

    fn job_name_line(&self, name: &str) -> Option<String> {
        Some(format!("{PREFIX} --job-name={name}"))
    }
}

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^#SBATCH\s+--([A-Za-z0-9_-]+)(?:=(.*))?$").expect("static regex is valid")
    })
}

/// Parse `#SBATCH` lines back into a [`ResourceSpec`].
///
/// Lines without the prefix are ignored, so a whole script can be passed in.
/// `--job-name` is skipped since it is not a resource. Unknown options become
/// extensions.
pub fn parse_batch_directives(text: &str) -> Result<ResourceSpec> {
    let mut spec = ResourceSpec::default();

    for line in text.lines().map(str::trim) {
        if !line.starts_with(PREFIX) {
            continue;
        }
        let caps = directive_re().captures(line).ok_or_else(|| {
            RemoteflowError::InvalidResource(format!("malformed batch directive: '{line}'"))
        })?;
        let key = &caps[1];
        let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");

        if key == "job-name" {
            continue;
        }
        spec.set_from_str(key, value)?;
    }

    spec.validate()?;
    Ok(spec)
}
