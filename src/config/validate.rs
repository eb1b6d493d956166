// src/config/validate.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::model::{
    ConfigFile, EngineSettings, ExecConfigSection, RawConfigFile, RawEngineSection,
    RawResources, WorkerConfig,
};
use crate::errors::{RemoteflowError, Result};
use crate::resources::{ExecConfig, ResourceSpec, WallTime, WorkerProfile};
use crate::transport::RetryPolicy;
use crate::types::parse_duration;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::RemoteflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_workers(&raw)?;
        let engine = validate_engine(&raw.engine)?;
        let exec_configs = build_exec_configs(&raw.exec_config);

        let mut workers = BTreeMap::new();
        for (name, section) in &raw.worker {
            let profile = build_worker(name, section)?;
            if let Some(env) = &profile.default_exec_config {
                if !exec_configs.contains_key(env) {
                    return Err(RemoteflowError::ConfigError(format!(
                        "worker '{name}' has unknown default_exec_config '{env}'"
                    )));
                }
            }
            workers.insert(name.clone(), profile);
        }

        Ok(ConfigFile::new_unchecked(engine, workers, exec_configs))
    }
}

fn ensure_has_workers(cfg: &RawConfigFile) -> Result<()> {
    if cfg.worker.is_empty() {
        return Err(RemoteflowError::ConfigError(
            "config must contain at least one [worker.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn duration_field(section: &str, key: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| RemoteflowError::ConfigError(format!("[{section}].{key}: {e}")))
}

fn validate_engine(raw: &RawEngineSection) -> Result<EngineSettings> {
    let poll_interval = duration_field("engine", "poll_interval", &raw.poll_interval)?;
    if poll_interval.is_zero() {
        return Err(RemoteflowError::ConfigError(
            "[engine].poll_interval must be greater than zero".to_string(),
        ));
    }

    let r = &raw.retry;
    if r.max_attempts == 0 {
        return Err(RemoteflowError::ConfigError(
            "[engine.retry].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    let retry = RetryPolicy {
        max_attempts: r.max_attempts,
        initial_backoff: duration_field("engine.retry", "initial_backoff", &r.initial_backoff)?,
        max_backoff: duration_field("engine.retry", "max_backoff", &r.max_backoff)?,
        call_timeout: duration_field("engine.retry", "call_timeout", &r.call_timeout)?,
    };
    if retry.initial_backoff > retry.max_backoff {
        return Err(RemoteflowError::ConfigError(
            "[engine.retry].initial_backoff must not exceed max_backoff".to_string(),
        ));
    }
    if retry.call_timeout.is_zero() {
        return Err(RemoteflowError::ConfigError(
            "[engine.retry].call_timeout must be greater than zero".to_string(),
        ));
    }

    Ok(EngineSettings {
        poll_interval,
        state_file: raw.state_file.clone(),
        retry,
    })
}

fn build_exec_configs(raw: &BTreeMap<String, ExecConfigSection>) -> BTreeMap<String, ExecConfig> {
    raw.iter()
        .map(|(name, s)| {
            let env = ExecConfig {
                name: name.clone(),
                modules: s.modules.clone(),
                export: s.export.clone(),
                pre_run: s.pre_run.clone(),
                post_run: s.post_run.clone(),
            };
            (name.clone(), env)
        })
        .collect()
}

fn build_worker(name: &str, section: &WorkerConfig) -> Result<WorkerProfile> {
    let resources = ResourceSpec::try_from(&section.resources).map_err(|e| {
        RemoteflowError::ConfigError(format!("[worker.{name}.resources]: {e}"))
    })?;

    let mut profile = WorkerProfile::new(name, section.scheduler).with_default_resources(resources);
    profile.host = section.host.clone();
    profile.user = section.user.clone();
    profile.default_exec_config = section.default_exec_config.clone();
    if let Some(dir) = &section.work_dir {
        profile.work_dir = dir.clone();
    } else if profile.host.is_none() {
        profile.work_dir = PathBuf::from(".remoteflow/jobs");
    }
    if let Some(runner) = &section.runner {
        profile.runner = runner.clone();
    }
    if profile.user.is_some() && profile.host.is_none() {
        return Err(RemoteflowError::ConfigError(format!(
            "worker '{name}' sets user but no host"
        )));
    }
    Ok(profile)
}

impl TryFrom<&RawResources> for ResourceSpec {
    type Error = RemoteflowError;

    fn try_from(raw: &RawResources) -> Result<Self> {
        let time = raw
            .time
            .as_deref()
            .map(str::parse::<WallTime>)
            .transpose()
            .map_err(RemoteflowError::InvalidResource)?;

        let mut extensions = BTreeMap::new();
        for (key, value) in &raw.extra {
            let text = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(RemoteflowError::InvalidResource(format!(
                        "extension '{key}' must be a scalar (got {})",
                        other.type_str()
                    )));
                }
            };
            extensions.insert(key.clone(), text);
        }

        let spec = ResourceSpec {
            nodes: raw.nodes,
            tasks: raw.ntasks,
            cpus_per_task: raw.cpus_per_task,
            time,
            extensions,
        };
        spec.validate()?;
        Ok(spec)
    }
}
