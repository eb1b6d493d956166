// src/transport/shell.rs

//! Process-backed transport for shell and local workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::errors::{RemoteflowError, Result};
use crate::resources::worker::shell_quote;
use crate::transport::command::build_command;
use crate::transport::{
    DispatchRequest, RemoteHandle, RemoteState, RemoteTransport, TransportFuture, parse_outputs,
    tail_lines,
};

const DIAGNOSTIC_LINES: usize = 20;

struct ShellJob {
    state: RemoteState,
    cancel: Option<oneshot::Sender<()>>,
}

type JobTable = Arc<Mutex<HashMap<String, ShellJob>>>;

/// Runs each submission script through `sh -s` (or `ssh <target> sh -s`)
/// and keeps the process state in memory.
///
/// Handles do not survive a restart of this process: polling an unknown
/// handle reports the job as failed.
pub struct ShellTransport {
    target: Option<String>,
    work_dir: PathBuf,
    jobs: JobTable,
    next_id: AtomicU64,
}

impl ShellTransport {
    pub fn new(target: Option<String>, work_dir: PathBuf) -> Self {
        Self {
            target,
            work_dir,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Jobs whose final state has not been polled yet.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.lock().map(|table| table.len()).unwrap_or(0)
    }

    /// Script prefixed with a change into the worker directory.
    fn prepare_script(&self, script: &str) -> String {
        let dir = shell_quote(&self.work_dir.to_string_lossy());
        format!("mkdir -p {dir} && cd {dir} || exit 1\n{script}")
    }

    fn spawn(&self, script: &str) -> Result<Child> {
        let mut cmd: Command = build_command(self.target.as_deref(), "sh", &["-s".to_string()]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| RemoteflowError::Transport(format!("spawning shell: {e}")))?;
        debug!(target = ?self.target, bytes = script.len(), "shell spawned");
        Ok(child)
    }

    fn set_state(jobs: &JobTable, id: &str, state: RemoteState) {
        let Ok(mut table) = jobs.lock() else {
            warn!(handle = %id, "shell job table poisoned; dropping state update");
            return;
        };
        // Cancelled jobs are already gone from the table.
        if let Some(job) = table.get_mut(id) {
            job.state = state;
            job.cancel = None;
        }
    }
}

impl RemoteTransport for ShellTransport {
    fn dispatch<'a>(&'a self, request: &'a DispatchRequest) -> TransportFuture<'a, RemoteHandle> {
        Box::pin(async move {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            let handle = RemoteHandle::new(format!("shell-{n}-{}", request.job_id));

            let script = self.prepare_script(&request.script);
            let mut child = self.spawn(&script)?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(script.as_bytes())
                    .await
                    .map_err(|e| RemoteflowError::Transport(format!("writing script: {e}")))?;
            }

            let (cancel_tx, cancel_rx) = oneshot::channel();
            {
                let mut table = self
                    .jobs
                    .lock()
                    .map_err(|_| RemoteflowError::Transport("shell job table poisoned".into()))?;
                table.insert(
                    handle.id.clone(),
                    ShellJob {
                        state: RemoteState::Running,
                        cancel: Some(cancel_tx),
                    },
                );
            }

            info!(job = %request.job_id, handle = %handle, "shell job started");
            tokio::spawn(supervise(
                child,
                handle.id.clone(),
                Arc::clone(&self.jobs),
                cancel_rx,
            ));
            Ok(handle)
        })
    }

    fn poll<'a>(&'a self, handle: &'a RemoteHandle) -> TransportFuture<'a, RemoteState> {
        Box::pin(async move {
            let mut table = self
                .jobs
                .lock()
                .map_err(|_| RemoteflowError::Transport("shell job table poisoned".into()))?;
            let Some(job) = table.get(&handle.id) else {
                return Ok(RemoteState::Failed {
                    diagnostic: format!("unknown shell handle {handle}; process state was lost"),
                });
            };
            let state = job.state.clone();
            // A terminal state is reported once; the entry is dropped with it.
            if state.is_terminal() {
                table.remove(&handle.id);
            }
            Ok(state)
        })
    }

    fn cancel<'a>(&'a self, handle: &'a RemoteHandle) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            let mut table = self
                .jobs
                .lock()
                .map_err(|_| RemoteflowError::Transport("shell job table poisoned".into()))?;
            let Some(job) = table.get_mut(&handle.id) else {
                return Ok(false);
            };
            if job.state.is_terminal() {
                return Ok(false);
            }
            if let Some(tx) = job.cancel.take() {
                let _ = tx.send(());
            }
            table.remove(&handle.id);
            info!(handle = %handle, "shell job cancelled");
            Ok(true)
        })
    }
}

/// Wait for the process (or a cancel request) and record the final state.
async fn supervise(
    mut child: Child,
    id: String,
    jobs: JobTable,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = tokio::spawn(read_stream(stdout, id.clone(), "stdout"));
    let stderr_task = tokio::spawn(read_stream(stderr, id.clone(), "stderr"));

    tokio::select! {
        status = child.wait() => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();

            let state = match status {
                Ok(status) if status.success() => RemoteState::Completed {
                    outputs: parse_outputs(&stdout),
                },
                Ok(status) => RemoteState::Failed {
                    diagnostic: format!(
                        "exit code {}: {}",
                        status.code().unwrap_or(-1),
                        tail_lines(&stderr, DIAGNOSTIC_LINES)
                    ),
                },
                Err(e) => RemoteState::Failed {
                    diagnostic: format!("waiting for shell process: {e}"),
                },
            };
            debug!(handle = %id, ?state, "shell process exited");
            ShellTransport::set_state(&jobs, &id, state);
        }

        cancel = &mut cancel_rx => {
            if cancel.is_ok() {
                if let Err(e) = child.kill().await {
                    warn!(handle = %id, error = %e, "failed to kill shell process");
                }
            }
            ShellTransport::set_state(&jobs, &id, RemoteState::Cancelled);
        }
    }
}

/// Everything the stream yields, decoded lossily. Read errors are logged and
/// whatever arrived before them is kept.
async fn read_stream<R>(stream: Option<R>, id: String, name: &'static str) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = stream.read_to_end(&mut buf).await {
        warn!(handle = %id, stream = name, error = %e, "reading shell output failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
