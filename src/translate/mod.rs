// src/translate/mod.rs

//! Resource translation.
//!
//! Turns an abstract [`ResourceSpec`] plus a [`WorkerProfile`] into a
//! concrete [`Directive`] for the worker's scheduler family, and renders the
//! full submission script around a job payload.
//!
//! One [`DirectiveTranslator`] exists per [`SchedulerFamily`]:
//! - [`slurm::SlurmTranslator`] for batch queues (`#SBATCH` lines),
//! - [`shell::ShellTranslator`] for plain shells (exports + `timeout`),
//! - [`local::LocalTranslator`] for unscheduled local processes.
//!
//! Everything here is pure: no IO, no clock.

pub mod local;
pub mod shell;
pub mod slurm;

use tracing::debug;

use crate::errors::{RemoteflowError, Result};
use crate::resources::{ExecConfig, ResourceField, ResourceSpec, WorkerProfile};
use crate::transport::JobPayload;
use crate::types::SchedulerFamily;

pub use local::LocalTranslator;
pub use shell::ShellTranslator;
pub use slurm::{SlurmTranslator, parse_batch_directives};

/// Heredoc delimiter wrapping the JSON payload in rendered scripts.
pub const PAYLOAD_DELIMITER: &str = "REMOTEFLOW_INPUT";

/// Per-family rendering rules.
pub trait DirectiveTranslator: Send + Sync {
    fn family(&self) -> SchedulerFamily;

    /// Fields that must be set after merging worker defaults.
    fn required_fields(&self) -> &'static [ResourceField] {
        &[]
    }

    /// Reject values the family cannot express.
    fn check_supported(&self, _spec: &ResourceSpec) -> Result<()> {
        Ok(())
    }

    /// Header lines for an effective (merged, validated) spec.
    fn render_lines(&self, spec: &ResourceSpec) -> Vec<String>;

    fn job_name_line(&self, _name: &str) -> Option<String> {
        None
    }

    /// Wrap the payload command, e.g. with a wall-clock limit.
    fn wrap_command(&self, command: String, _spec: &ResourceSpec) -> String {
        command
    }
}

/// Translator registered for `family`.
pub fn translator_for(family: SchedulerFamily) -> &'static dyn DirectiveTranslator {
    match family {
        SchedulerFamily::BatchQueue => &SlurmTranslator,
        SchedulerFamily::InteractiveShell => &ShellTranslator,
        SchedulerFamily::Local => &LocalTranslator,
    }
}

/// A concrete scheduler request for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub family: SchedulerFamily,
    /// Effective request after merging worker defaults.
    pub resources: ResourceSpec,
    pub lines: Vec<String>,
}

impl Directive {
    /// Full submission script:
    ///
    /// ```text
    /// #!/bin/bash
    /// <job name line>
    /// <directive lines>
    /// set -e
    /// <exec config setup>
    /// <runner> <<'REMOTEFLOW_INPUT'
    /// <payload json>
    /// REMOTEFLOW_INPUT
    /// <post-run lines, stdout sent to stderr>
    /// ```
    ///
    /// The runner is expected to print a JSON object of outputs as its last
    /// line of stdout, so post-run output is kept off stdout.
    pub fn render_script(
        &self,
        payload: &JobPayload,
        runner: &str,
        exec_config: Option<&ExecConfig>,
    ) -> Result<String> {
        let translator = translator_for(self.family);
        let input = serde_json::to_string(payload)?;

        let mut lines = vec!["#!/bin/bash".to_string()];
        lines.extend(translator.job_name_line(&script_job_name(payload)));
        lines.extend(self.lines.iter().cloned());
        lines.push("set -e".to_string());

        if let Some(env) = exec_config {
            lines.extend(env.setup_lines());
        }

        let command = translator.wrap_command(runner.to_string(), &self.resources);
        lines.push(format!("{command} <<'{PAYLOAD_DELIMITER}'"));
        lines.push(input);
        lines.push(PAYLOAD_DELIMITER.to_string());

        if let Some(env) = exec_config {
            for line in &env.post_run {
                lines.push(format!("{{ {line} ; }} 1>&2"));
            }
        }

        let mut script = lines.join("\n");
        script.push('\n');
        Ok(script)
    }
}

/// Scheduler-visible job name: `<name>-<first 8 chars of the job id>`.
fn script_job_name(payload: &JobPayload) -> String {
    let short: String = payload.job_id.chars().take(8).collect();
    let name: String = payload
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if name.is_empty() {
        short
    } else {
        format!("{name}-{short}")
    }
}

/// Translate `request` for `worker`.
///
/// 1. fill unset fields from the worker defaults (explicit values win),
/// 2. validate values (`InvalidResource`),
/// 3. check the family's required and supported fields
///    (`UnsupportedResourceField`),
/// 4. render the directive lines.
pub fn translate(request: &ResourceSpec, worker: &WorkerProfile) -> Result<Directive> {
    let translator = translator_for(worker.family);
    let effective = request.merged_over(&worker.default_resources);
    effective.validate()?;

    for field in translator.required_fields() {
        if !effective.has(*field) {
            return Err(RemoteflowError::UnsupportedResourceField {
                field: field.to_string(),
                family: worker.family,
                reason: format!(
                    "required, but neither requested nor defaulted by worker '{}'",
                    worker.name
                ),
            });
        }
    }
    translator.check_supported(&effective)?;

    let lines = translator.render_lines(&effective);
    debug!(
        worker = %worker.name,
        family = %worker.family,
        lines = lines.len(),
        "resources translated"
    );

    Ok(Directive {
        family: worker.family,
        resources: effective,
        lines,
    })
}
