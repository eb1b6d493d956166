// src/transport/command.rs

//! Run a command on this machine or on a worker host over ssh.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{RemoteflowError, Result};
use crate::resources::worker::shell_quote;

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Build a [`Command`] running `program args...`, wrapped in
/// `ssh -o BatchMode=yes <target>` when `target` is set.
pub fn build_command(target: Option<&str>, program: &str, args: &[String]) -> Command {
    match target {
        Some(target) => {
            let remote = std::iter::once(program.to_string())
                .chain(args.iter().map(|a| shell_quote(a)))
                .collect::<Vec<_>>()
                .join(" ");
            let mut cmd = Command::new("ssh");
            cmd.arg("-o").arg("BatchMode=yes").arg(target).arg(remote);
            cmd
        }
        None => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

/// Run to completion, feeding `stdin` if given.
///
/// Failing to start the process, or ssh failing to connect, is a transport
/// error. A non-zero exit of the command itself is returned as output for
/// the caller to interpret.
pub async fn run_command(
    target: Option<&str>,
    program: &str,
    args: &[String],
    stdin: Option<&str>,
) -> Result<CommandOutput> {
    debug!(target = ?target, program = %program, ?args, "running command");

    let mut cmd = build_command(target, program, args);
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| RemoteflowError::Transport(format!("spawning '{program}': {e}")))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| RemoteflowError::Transport(format!("writing stdin of '{program}': {e}")))?;
        // Dropping the pipe closes stdin.
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| RemoteflowError::Transport(format!("waiting for '{program}': {e}")))?;

    let result = CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if target.is_some() && result.code == Some(SSH_CONNECTION_FAILURE) {
        return Err(RemoteflowError::Transport(format!(
            "ssh connection failed: {}",
            result.stderr.trim()
        )));
    }
    Ok(result)
}
