// src/resources/mod.rs

//! Abstract resource requests and the workers they are sent to.
//!
//! - [`spec`] holds [`ResourceSpec`], the scheduler-independent request, and
//!   [`WallTime`], the Slurm-style duration used for wall-clock limits.
//! - [`worker`] holds [`WorkerProfile`] (a named remote target) and
//!   [`ExecConfig`] (a named execution environment on that target).

pub mod spec;
pub mod worker;

pub use spec::{ResourceField, ResourceSpec, WallTime};
pub use worker::{ExecConfig, WorkerProfile};
