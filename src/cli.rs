// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `remoteflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "remoteflow",
    version,
    about = "Submit job flows to remote workers and follow them to completion.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Remoteflow.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Remoteflow.toml")]
    pub config: String,

    /// Flow file to submit (TOML with `[flow]` and `[[job]]` tables).
    #[arg(long, value_name = "PATH", required_unless_present = "resume")]
    pub flow: Option<String>,

    /// Worker for jobs without their own. Overrides the flow file.
    ///
    /// If neither is set and exactly one worker is configured, that one is
    /// used.
    #[arg(long, value_name = "NAME")]
    pub worker: Option<String>,

    /// Execution environment (`[exec_config.<name>]`) for every job.
    #[arg(long, value_name = "NAME")]
    pub exec_config: Option<String>,

    /// Submission-level resources, e.g. `nodes=1,ntasks=4,time=01:00:00`.
    /// Merged over the flow file's `[flow.resources]`.
    #[arg(long, value_name = "KEY=VALUE,...")]
    pub resources: Option<String>,

    /// Validate and plan, print the rendered scripts in submission order,
    /// but don't dispatch anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Resume a previously submitted flow from the state file.
    #[arg(long, value_name = "FLOW_ID", conflicts_with_all = ["flow", "dry_run"])]
    pub resume: Option<String>,

    /// Transition log to use instead of `[engine].state_file`.
    #[arg(long, value_name = "PATH")]
    pub state: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `REMOTEFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
