// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::flow_file::{LoadedFlow, RawFlowFile};
use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; semantic checks happen in
/// [`load_and_validate`].
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;
    debug!(path = ?path, workers = config.worker.len(), "config parsed");

    Ok(config)
}

/// Load a configuration file and validate it:
///
/// - durations parse and are positive,
/// - every worker's default resources are valid,
/// - every `default_exec_config` names a configured `[exec_config.<name>]`.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Parse a flow description from TOML text and validate the resulting flow.
pub fn parse_flow(text: &str) -> Result<LoadedFlow> {
    let raw: RawFlowFile = toml::from_str(text)?;
    LoadedFlow::try_from(raw)
}

pub fn load_flow_file(path: impl AsRef<Path>) -> Result<LoadedFlow> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let loaded = parse_flow(&contents)?;
    debug!(path = ?path, flow = %loaded.flow.name, jobs = loaded.flow.len(), "flow file loaded");
    Ok(loaded)
}

/// `Remoteflow.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Remoteflow.toml")
}
