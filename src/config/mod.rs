// src/config/mod.rs

//! Configuration loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`, `flow_file.rs`).
//! - Load config and flow files from disk (`loader.rs`).
//! - Turn raw sections into validated worker profiles, execution
//!   environments and engine settings (`validate.rs`).

pub mod flow_file;
pub mod loader;
pub mod model;
pub mod validate;

pub use flow_file::LoadedFlow;
pub use loader::{load_and_validate, load_flow_file, load_from_path, parse_flow};
pub use model::{ConfigFile, EngineSettings, RawConfigFile, RawResources, WorkerConfig};
