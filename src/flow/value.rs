// src/flow/value.rs

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::JobId;

/// Slot name used when a job does not declare its outputs explicitly.
pub const DEFAULT_SLOT: &str = "output";

/// Published outputs of a single job, keyed by slot name.
pub type OutputMap = BTreeMap<String, Value>;

/// Placeholder for an output that a job will publish once it completes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputReference {
    pub producer: JobId,
    pub slot: String,
}

impl OutputReference {
    pub fn new(producer: impl Into<JobId>, slot: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            slot: slot.into(),
        }
    }
}

impl fmt::Display for OutputReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.producer, self.slot)
    }
}

/// A job input: either a value known now, or another job's future output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Argument {
    Concrete(Value),
    Pending(OutputReference),
}

impl Argument {
    pub fn reference(&self) -> Option<&OutputReference> {
        match self {
            Argument::Pending(r) => Some(r),
            Argument::Concrete(_) => None,
        }
    }

    /// Concrete value of this argument, looking references up in `published`.
    ///
    /// Returns `None` while the referenced slot has not been published.
    pub fn resolve(&self, published: &HashMap<JobId, OutputMap>) -> Option<Value> {
        match self {
            Argument::Concrete(v) => Some(v.clone()),
            Argument::Pending(r) => published.get(&r.producer)?.get(&r.slot).cloned(),
        }
    }
}

impl From<OutputReference> for Argument {
    fn from(r: OutputReference) -> Self {
        Argument::Pending(r)
    }
}

impl From<Value> for Argument {
    fn from(v: Value) -> Self {
        Argument::Concrete(v)
    }
}

macro_rules! concrete_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Argument {
                fn from(v: $t) -> Self {
                    Argument::Concrete(Value::from(v))
                }
            }
        )*
    };
}

concrete_from!(i32, i64, u32, u64, f64, bool, String, &str);
