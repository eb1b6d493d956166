// src/flow/mod.rs

//! Flow data model.
//!
//! - [`value`] holds [`Argument`] and [`OutputReference`], the tagged
//!   "concrete value or future output" used for job inputs.
//! - [`job`] holds [`JobNode`], one deferred call.
//! - [`flow`] holds [`Flow`], an ordered (possibly nested) collection of jobs.
//! - [`validate`] checks a flow for duplicate ids, dangling references and
//!   cycles before anything is submitted.

pub mod flow;
pub mod job;
pub mod validate;
pub mod value;

pub use flow::{Flow, FlowItem};
pub use job::JobNode;
pub use validate::{find_cycle, validate_flow};
pub use value::{Argument, DEFAULT_SLOT, OutputMap, OutputReference};
