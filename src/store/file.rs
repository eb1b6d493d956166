// src/store/file.rs

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::{RemoteflowError, Result};
use crate::fs::{FileSystem, RealFileSystem};
use crate::store::{LogEntry, SubmissionStore};

/// Transition log kept as JSON lines in a single file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    // Serializes read-modify-write during purge against appends.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_fs(path, Arc::new(RealFileSystem))
    }

    pub fn with_fs(path: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            path: path.into(),
            fs,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every well-formed entry in the file. Unparseable lines (e.g. a torn
    /// final write) are skipped with a warning.
    fn read_all(&self) -> Result<Vec<LogEntry>> {
        if !self.fs.exists(&self.path) {
            return Ok(Vec::new());
        }
        let text = self.fs.read_to_string(&self.path)?;

        let mut entries = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = ?self.path,
                    line = n + 1,
                    error = %e,
                    "skipping malformed state line"
                ),
            }
        }
        Ok(entries)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| RemoteflowError::Other(anyhow::anyhow!("state file lock poisoned")))
    }
}

fn encode(entry: &LogEntry) -> Result<String> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    Ok(line)
}

impl SubmissionStore for FileStore {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        let line = encode(entry)?;
        let _guard = self.guard()?;
        self.fs.append(&self.path, line.as_bytes())?;
        debug!(path = ?self.path, flow = %entry.flow_id(), "state entry appended");
        Ok(())
    }

    fn entries(&self, flow_id: &str) -> Result<Vec<LogEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.flow_id() == flow_id)
            .collect())
    }

    fn purge(&self, flow_id: &str) -> Result<()> {
        let _guard = self.guard()?;

        let mut out = String::new();
        let mut dropped = 0usize;
        for entry in self.read_all()? {
            if entry.flow_id() == flow_id {
                dropped += 1;
            } else {
                out.push_str(&encode(&entry)?);
            }
        }
        out.push_str(&encode(&LogEntry::Purged {
            flow_id: flow_id.to_string(),
            at: Utc::now(),
        })?);

        self.fs.write(&self.path, out.as_bytes())?;
        info!(flow = %flow_id, dropped, path = ?self.path, "flow purged from state file");
        Ok(())
    }
}
