use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Canonical job identifier used throughout the crate.
pub type JobId = String;

/// Canonical flow identifier.
pub type FlowId = String;

/// Lifecycle of a job inside a submitted flow.
///
/// ```text
/// Pending -> Ready -> Submitted -> Running -> Completed
///                                         \-> Failed -> (requeue) Pending
///                                         \-> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// At least one input is unresolved.
    Pending,
    /// All inputs resolved, not yet dispatched.
    Ready,
    /// Dispatched to a worker; remote handle assigned.
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the job currently occupies a remote slot.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Running)
    }

    /// Legal edges of the job state machine.
    ///
    /// `Failed -> Pending` is only ever taken through an explicit requeue.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Cancelled)
                | (Ready, Submitted)
                | (Ready, Failed)
                | (Ready, Cancelled)
                | (Submitted, Running)
                | (Submitted, Completed)
                | (Submitted, Failed)
                | (Submitted, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Ready => "READY",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Family of scheduler a worker talks to. Selects the directive translator
/// and the default transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerFamily {
    /// Slurm-like batch queue (`#SBATCH` directives).
    #[serde(alias = "slurm")]
    BatchQueue,
    /// Plain shell on a (possibly remote) host.
    #[serde(alias = "shell")]
    InteractiveShell,
    /// No scheduler at all; jobs run as local processes.
    #[serde(alias = "none")]
    Local,
}

impl SchedulerFamily {
    pub fn is_batch_queue(self) -> bool {
        matches!(self, SchedulerFamily::BatchQueue)
    }
}

impl Default for SchedulerFamily {
    fn default() -> Self {
        SchedulerFamily::Local
    }
}

impl fmt::Display for SchedulerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerFamily::BatchQueue => "batch-queue",
            SchedulerFamily::InteractiveShell => "interactive-shell",
            SchedulerFamily::Local => "local",
        };
        f.write_str(s)
    }
}

impl FromStr for SchedulerFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "batch_queue" | "slurm" => Ok(SchedulerFamily::BatchQueue),
            "interactive_shell" | "shell" => Ok(SchedulerFamily::InteractiveShell),
            "local" | "none" => Ok(SchedulerFamily::Local),
            other => Err(format!(
                "invalid scheduler family: {other} (expected \"batch_queue\", \"shell\" or \"local\")"
            )),
        }
    }
}

/// Parse a short duration string such as `"500ms"`, `"5s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    let out_of_range = || format!("duration '{}' is out of range", s);
    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(out_of_range),
        "h" => value
            .checked_mul(3_600)
            .map(Duration::from_secs)
            .ok_or_else(out_of_range),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
