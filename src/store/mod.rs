// src/store/mod.rs

//! Append-only persistence of submissions and job transitions.
//!
//! Every accepted flow and every job status change is appended as a
//! [`LogEntry`]. A flow can be rebuilt from its entries with
//! [`records::replay`], which is what resuming after a restart relies on.

pub mod file;
pub mod records;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use chrono::Utc;
use tracing::debug;

use crate::errors::{RemoteflowError, Result};

pub use file::FileStore;
pub use records::{
    LogEntry, ReplayedFlow, ReplayedJob, SubmissionRecord, TransitionRecord, replay,
};

/// Storage backend for the transition log.
pub trait SubmissionStore: Send + Sync + Debug {
    fn append(&self, entry: &LogEntry) -> Result<()>;

    /// Entries of one flow, in append order.
    fn entries(&self, flow_id: &str) -> Result<Vec<LogEntry>>;

    /// Drop everything recorded for `flow_id`, leaving a `Purged` marker.
    fn purge(&self, flow_id: &str) -> Result<()>;

    /// Whether `flow_id` has a submission that was not purged since.
    fn is_recorded(&self, flow_id: &str) -> Result<bool> {
        Ok(self
            .entries(flow_id)?
            .iter()
            .rev()
            .take_while(|e| !matches!(e, LogEntry::Purged { .. }))
            .any(|e| matches!(e, LogEntry::FlowSubmitted { .. })))
    }

    /// Convenience: entries of `flow_id` replayed into a [`ReplayedFlow`].
    fn replay(&self, flow_id: &str) -> Result<ReplayedFlow> {
        replay(flow_id, &self.entries(flow_id)?)
    }
}

/// Volatile store, used when no state file is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<LogEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<LogEntry>>>> {
        self.entries
            .lock()
            .map_err(|_| RemoteflowError::Other(anyhow::anyhow!("memory store lock poisoned")))
    }
}

impl SubmissionStore for MemoryStore {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        self.lock()?
            .entry(entry.flow_id().to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn entries(&self, flow_id: &str) -> Result<Vec<LogEntry>> {
        Ok(self.lock()?.get(flow_id).cloned().unwrap_or_default())
    }

    fn purge(&self, flow_id: &str) -> Result<()> {
        let marker = LogEntry::Purged {
            flow_id: flow_id.to_string(),
            at: Utc::now(),
        };
        self.lock()?.insert(flow_id.to_string(), vec![marker]);
        debug!(flow = %flow_id, "flow purged from memory store");
        Ok(())
    }
}
