// src/resources/spec.rs

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{RemoteflowError, Result};

/// Wall-clock limit, stored in whole seconds.
///
/// Parsing accepts every Slurm `--time` form: `M`, `M:S`, `H:M:S`, `D-H`,
/// `D-H:M` and `D-H:M:S`. Rendering always produces `HH:MM:SS`, prefixed by
/// `D-` when the limit spans at least one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WallTime {
    secs: u64,
}

impl WallTime {
    pub fn from_secs(secs: u64) -> Self {
        Self { secs }
    }

    pub fn from_minutes(minutes: u64) -> Self {
        Self {
            secs: minutes.saturating_mul(60),
        }
    }

    pub fn as_secs(&self) -> u64 {
        self.secs
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.secs)
    }
}

fn parse_component(part: &str, whole: &str) -> std::result::Result<u64, String> {
    part.trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid wall time '{whole}': '{part}' is not a number"))
}

impl FromStr for WallTime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty wall time".to_string());
        }

        let (days, clock) = match s.split_once('-') {
            Some((d, rest)) => (Some(parse_component(d, s)?), rest),
            None => (None, s),
        };

        let parts = clock
            .split(':')
            .map(|p| parse_component(p, s))
            .collect::<std::result::Result<Vec<u64>, String>>()?;

        let (h, m, sec) = match (days.is_some(), parts.as_slice()) {
            // With a day prefix the first component is hours.
            (true, [h]) => (*h, 0, 0),
            (true, [h, m]) => (*h, *m, 0),
            // Without one, a lone number is minutes.
            (false, [m]) => (0, *m, 0),
            (false, [m, sec]) => (0, *m, *sec),
            (_, [h, m, sec]) => (*h, *m, *sec),
            _ => return Err(format!("invalid wall time '{s}': too many ':' components")),
        };

        let secs = [(days.unwrap_or(0), 86_400), (h, 3_600), (m, 60), (sec, 1)]
            .into_iter()
            .try_fold(0u64, |acc, (value, unit)| {
                value.checked_mul(unit).and_then(|v| acc.checked_add(v))
            })
            .ok_or_else(|| format!("invalid wall time '{s}': out of range"))?;
        if secs == 0 {
            return Err(format!("invalid wall time '{s}': must be positive"));
        }
        Ok(WallTime { secs })
    }
}

impl TryFrom<String> for WallTime {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WallTime> for String {
    fn from(value: WallTime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.secs / 86_400;
        let h = (self.secs % 86_400) / 3_600;
        let m = (self.secs % 3_600) / 60;
        let s = self.secs % 60;
        if days > 0 {
            write!(f, "{days}-{h:02}:{m:02}:{s:02}")
        } else {
            write!(f, "{h:02}:{m:02}:{s:02}")
        }
    }
}

/// The fields of a [`ResourceSpec`] that translators model explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceField {
    Nodes,
    Tasks,
    CpusPerTask,
    Time,
}

impl ResourceField {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceField::Nodes => "nodes",
            ResourceField::Tasks => "ntasks",
            ResourceField::CpusPerTask => "cpus_per_task",
            ResourceField::Time => "time",
        }
    }
}

impl fmt::Display for ResourceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys accepted by [`ResourceSpec::set_from_str`] for modeled fields.
const RESERVED_KEYS: &[&str] = &[
    "nodes",
    "ntasks",
    "tasks",
    "cpus_per_task",
    "cpus-per-task",
    "time",
    "walltime",
];

/// Scheduler-independent resource request.
///
/// Every field is optional on the request side: missing values are filled
/// from the worker's defaults by the translator. `extensions` are opaque
/// key/value pairs handed to the scheduler verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,

    #[serde(default, alias = "ntasks", skip_serializing_if = "Option::is_none")]
    pub tasks: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_per_task: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<WallTime>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

impl ResourceSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(mut self, n: u32) -> Self {
        self.nodes = Some(n);
        self
    }

    pub fn tasks(mut self, n: u32) -> Self {
        self.tasks = Some(n);
        self
    }

    pub fn cpus_per_task(mut self, n: u32) -> Self {
        self.cpus_per_task = Some(n);
        self
    }

    pub fn time(mut self, time: WallTime) -> Self {
        self.time = Some(time);
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_none()
            && self.tasks.is_none()
            && self.cpus_per_task.is_none()
            && self.time.is_none()
            && self.extensions.is_empty()
    }

    pub fn has(&self, field: ResourceField) -> bool {
        match field {
            ResourceField::Nodes => self.nodes.is_some(),
            ResourceField::Tasks => self.tasks.is_some(),
            ResourceField::CpusPerTask => self.cpus_per_task.is_some(),
            ResourceField::Time => self.time.is_some(),
        }
    }

    /// Fill unset fields from `defaults`. Explicit values always win;
    /// extensions are merged key by key.
    pub fn merged_over(&self, defaults: &ResourceSpec) -> ResourceSpec {
        let mut extensions = defaults.extensions.clone();
        extensions.extend(self.extensions.iter().map(|(k, v)| (k.clone(), v.clone())));

        ResourceSpec {
            nodes: self.nodes.or(defaults.nodes),
            tasks: self.tasks.or(defaults.tasks),
            cpus_per_task: self.cpus_per_task.or(defaults.cpus_per_task),
            time: self.time.or(defaults.time),
            extensions,
        }
    }

    /// Reject counts below one, and extensions that shadow a modeled field.
    pub fn validate(&self) -> Result<()> {
        for key in self.extensions.keys() {
            if key.trim().is_empty() {
                return Err(RemoteflowError::InvalidResource(
                    "extension keys must not be empty".to_string(),
                ));
            }
            if RESERVED_KEYS.contains(&key.as_str()) {
                return Err(RemoteflowError::InvalidResource(format!(
                    "'{key}' is a resource field, not an extension"
                )));
            }
        }

        let counts = [
            (ResourceField::Nodes, self.nodes),
            (ResourceField::Tasks, self.tasks),
            (ResourceField::CpusPerTask, self.cpus_per_task),
        ];
        for (field, value) in counts {
            if value == Some(0) {
                return Err(RemoteflowError::InvalidResource(format!(
                    "{field} must be >= 1 (got 0)"
                )));
            }
        }
        Ok(())
    }

    /// Set one field from its textual key, as used by `--resources` and the
    /// directive parser. Unknown keys become extensions.
    pub fn set_from_str(&mut self, key: &str, value: &str) -> Result<()> {
        let count = |v: &str| -> Result<u32> {
            v.trim().parse::<u32>().map_err(|_| {
                RemoteflowError::InvalidResource(format!("{key} must be an integer (got '{v}')"))
            })
        };

        match key.trim() {
            "nodes" => self.nodes = Some(count(value)?),
            "ntasks" | "tasks" => self.tasks = Some(count(value)?),
            "cpus_per_task" | "cpus-per-task" => self.cpus_per_task = Some(count(value)?),
            "time" | "walltime" => {
                let t = value
                    .parse::<WallTime>()
                    .map_err(RemoteflowError::InvalidResource)?;
                self.time = Some(t);
            }
            other => {
                self.extensions
                    .insert(other.to_string(), value.trim().to_string());
            }
        }
        Ok(())
    }
}

/// Parses `nodes=1,ntasks=4,time=00:20:00,partition=debug`.
impl FromStr for ResourceSpec {
    type Err = RemoteflowError;

    fn from_str(s: &str) -> Result<Self> {
        let mut spec = ResourceSpec::default();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                RemoteflowError::InvalidResource(format!("expected key=value, got '{pair}'"))
            })?;
            spec.set_from_str(key, value)?;
        }
        spec.validate()?;
        Ok(spec)
    }
}
