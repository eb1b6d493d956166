// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::types::{JobId, JobStatus, SchedulerFamily};

#[derive(Error, Debug)]
pub enum RemoteflowError {
    #[error("Duplicate job id: {0}")]
    DuplicateId(JobId),

    #[error("Dangling reference: job '{consumer}' references {producer}.{slot}, which is not in the flow")]
    DanglingReference {
        consumer: JobId,
        producer: JobId,
        slot: String,
    },

    #[error("Cycle detected in flow: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<JobId> },

    #[error("Resource field '{field}' is not supported by {family} workers: {reason}")]
    UnsupportedResourceField {
        field: String,
        family: SchedulerFamily,
        reason: String,
    },

    #[error("Invalid resource request: {0}")]
    InvalidResource(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote execution of job '{job}' failed: {diagnostic}")]
    RemoteExecution { job: JobId, diagnostic: String },

    #[error("Job '{job}' blocked by failed dependency '{dependency}'")]
    DependencyBlocked { job: JobId, dependency: JobId },

    #[error("Invalid transition for job '{job}': {from} -> {to}")]
    InvalidTransition {
        job: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Unknown exec config: {0}")]
    UnknownExecConfig(String),

    #[error("Unknown submission: {0}")]
    UnknownSubmission(String),

    #[error("Flow '{0}' still has unfinished jobs")]
    FlowActive(String),

    #[error("Job not found: {0}")]
    UnknownJob(JobId),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RemoteflowError {
    /// Flow-shape problems, rejected before anything is dispatched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RemoteflowError::DuplicateId(_)
                | RemoteflowError::DanglingReference { .. }
                | RemoteflowError::Cycle { .. }
        )
    }

    /// Resource problems found while rendering a directive.
    pub fn is_translation(&self) -> bool {
        matches!(
            self,
            RemoteflowError::UnsupportedResourceField { .. } | RemoteflowError::InvalidResource(_)
        )
    }

    /// Only transport failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteflowError::Transport(_))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, RemoteflowError>;
