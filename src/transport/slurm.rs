// src/transport/slurm.rs

//! Batch-queue transport driving the Slurm command line tools.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{RemoteflowError, Result};
use crate::transport::command::{CommandOutput, run_command};
use crate::transport::{
    DispatchRequest, RemoteHandle, RemoteState, RemoteTransport, TransportFuture, parse_outputs,
    tail_lines,
};

pub const STDOUT_FILE: &str = "remoteflow.out";
pub const STDERR_FILE: &str = "remoteflow.err";

const DIAGNOSTIC_LINES: usize = 20;

/// Coarse classification of a Slurm job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlurmState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Map a `sacct` `State` column to a [`SlurmState`].
///
/// `sacct` appends details to some states (`CANCELLED by 1000`), so only the
/// first word counts. Unknown states are treated as still queued.
pub fn classify_state(raw: &str) -> SlurmState {
    let word = raw.split_whitespace().next().unwrap_or("").trim_end_matches('+');
    match word {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESIZING" => {
            SlurmState::Queued
        }
        "RUNNING" | "COMPLETING" | "SUSPENDED" | "STAGE_OUT" | "SIGNALING" => SlurmState::Running,
        "COMPLETED" => SlurmState::Completed,
        "CANCELLED" | "REVOKED" => SlurmState::Cancelled,
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" | "SPECIAL_EXIT" => SlurmState::Failed,
        other => {
            if !other.is_empty() {
                warn!(state = %other, "unrecognised slurm state; treating as queued");
            }
            SlurmState::Queued
        }
    }
}

/// Parse `sbatch --parsable` output: `<id>` or `<id>;<cluster>`.
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        Some(id.to_string())
    } else {
        None
    }
}

pub struct SlurmTransport {
    target: Option<String>,
    work_dir: PathBuf,
}

impl SlurmTransport {
    pub fn new(target: Option<String>, work_dir: PathBuf) -> Self {
        Self { target, work_dir }
    }

    fn job_dir(&self, request: &DispatchRequest) -> PathBuf {
        self.work_dir.join(&request.flow_id).join(&request.job_id)
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput> {
        run_command(self.target.as_deref(), program, args, stdin).await
    }

    async fn tail(&self, dir: &Path, file: &str, lines: usize) -> Result<String> {
        let path = dir.join(file).to_string_lossy().into_owned();
        let out = self
            .run("tail", &["-n".to_string(), lines.to_string(), path], None)
            .await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(RemoteflowError::Transport(format!(
                "reading {file}: {}",
                out.stderr.trim()
            )))
        }
    }

    async fn finished_state(&self, handle: &RemoteHandle, state: SlurmState) -> Result<RemoteState> {
        let Some(dir) = handle.job_dir.as_deref() else {
            return Ok(match state {
                SlurmState::Completed => RemoteState::Completed {
                    outputs: parse_outputs(""),
                },
                _ => RemoteState::Failed {
                    diagnostic: format!("slurm job {handle} ended without a job directory"),
                },
            });
        };

        if state == SlurmState::Completed {
            let last = self.tail(dir, STDOUT_FILE, 1).await?;
            return Ok(RemoteState::Completed {
                outputs: parse_outputs(&last),
            });
        }

        let stderr = self
            .tail(dir, STDERR_FILE, DIAGNOSTIC_LINES)
            .await
            .unwrap_or_default();
        Ok(RemoteState::Failed {
            diagnostic: format!(
                "slurm job {handle} failed: {}",
                tail_lines(&stderr, DIAGNOSTIC_LINES)
            ),
        })
    }
}

impl RemoteTransport for SlurmTransport {
    fn dispatch<'a>(&'a self, request: &'a DispatchRequest) -> TransportFuture<'a, RemoteHandle> {
        Box::pin(async move {
            let dir = self.job_dir(request);
            let dir_str = dir.to_string_lossy().into_owned();

            let mkdir = self
                .run("mkdir", &["-p".to_string(), dir_str.clone()], None)
                .await?;
            if !mkdir.success() {
                return Err(RemoteflowError::Transport(format!(
                    "creating job directory {dir_str}: {}",
                    mkdir.stderr.trim()
                )));
            }

            let args = vec![
                "--parsable".to_string(),
                format!("--chdir={dir_str}"),
                format!("--output={}", dir.join(STDOUT_FILE).to_string_lossy()),
                format!("--error={}", dir.join(STDERR_FILE).to_string_lossy()),
            ];
            let out = self.run("sbatch", &args, Some(&request.script)).await?;

            if !out.success() {
                // The scheduler rejected the script; retrying will not help.
                return Err(RemoteflowError::RemoteExecution {
                    job: request.job_id.clone(),
                    diagnostic: format!("sbatch rejected the job: {}", out.stderr.trim()),
                });
            }

            let id = parse_job_id(&out.stdout).ok_or_else(|| {
                RemoteflowError::Transport(format!(
                    "unexpected sbatch output: '{}'",
                    out.stdout.trim()
                ))
            })?;

            info!(job = %request.job_id, slurm_id = %id, dir = %dir_str, "batch job submitted");
            Ok(RemoteHandle::new(id).with_job_dir(dir))
        })
    }

    fn poll<'a>(&'a self, handle: &'a RemoteHandle) -> TransportFuture<'a, RemoteState> {
        Box::pin(async move {
            let args = ["-j", handle.id.as_str(), "-X", "-n", "-P", "-o", "State"]
                .map(str::to_string);
            let out = self.run("sacct", &args, None).await?;
            if !out.success() {
                return Err(RemoteflowError::Transport(format!(
                    "sacct failed for {handle}: {}",
                    out.stderr.trim()
                )));
            }

            // Freshly submitted jobs may not be in the accounting database yet.
            let raw = out.stdout.lines().map(str::trim).find(|l| !l.is_empty());
            let state = raw.map(classify_state).unwrap_or(SlurmState::Queued);
            debug!(handle = %handle, raw = ?raw, ?state, "polled batch job");

            match state {
                SlurmState::Queued => Ok(RemoteState::Queued),
                SlurmState::Running => Ok(RemoteState::Running),
                SlurmState::Cancelled => Ok(RemoteState::Cancelled),
                SlurmState::Completed | SlurmState::Failed => {
                    self.finished_state(handle, state).await
                }
            }
        })
    }

    fn cancel<'a>(&'a self, handle: &'a RemoteHandle) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            let out = self.run("scancel", &[handle.id.clone()], None).await?;
            if out.success() {
                info!(handle = %handle, "scancel accepted");
                Ok(true)
            } else {
                warn!(handle = %handle, stderr = %out.stderr.trim(), "scancel refused");
                Ok(false)
            }
        })
    }
}
