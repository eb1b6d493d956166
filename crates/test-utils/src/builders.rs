#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use remoteflow::engine::{EngineOptions, SubmissionEngine};
use remoteflow::flow::{Argument, DEFAULT_SLOT, Flow, JobNode, OutputReference};
use remoteflow::resources::{ExecConfig, ResourceSpec, WallTime, WorkerProfile};
use remoteflow::store::SubmissionStore;
use remoteflow::transport::RetryPolicy;
use remoteflow::types::SchedulerFamily;

use crate::fake_transport::FakeTransport;

/// Callable the fake transport knows how to evaluate (sums its arguments).
pub const ADD: &str = "examples.add";

/// `examples.add` job with a fixed id.
pub fn add_job(id: &str, args: Vec<Argument>) -> JobNode {
    let mut job = JobNode::new(ADD).with_id(id);
    job.args = args;
    job
}

pub fn lit(value: i64) -> Argument {
    Argument::from(value)
}

/// Reference to the default output slot of `job`.
pub fn out(job: &str) -> Argument {
    Argument::Pending(OutputReference::new(job, DEFAULT_SLOT))
}

/// Flow with a fixed id, jobs in the given order.
pub fn flow_of(id: &str, jobs: Vec<JobNode>) -> Flow {
    Flow::from_jobs(id, jobs)
        .expect("jobs have unique ids")
        .with_id(id)
}

/// `a = add(1, 2)`, `b = add(a, 3)`.
pub fn add_chain(id: &str) -> Flow {
    flow_of(
        id,
        vec![
            add_job("a", vec![lit(1), lit(2)]),
            add_job("b", vec![out("a"), lit(3)]),
        ],
    )
}

/// `a` feeds `b` and `c`, which both feed `d`.
pub fn diamond(id: &str) -> Flow {
    flow_of(
        id,
        vec![
            add_job("a", vec![lit(1), lit(1)]),
            add_job("b", vec![out("a"), lit(10)]),
            add_job("c", vec![out("a"), lit(100)]),
            add_job("d", vec![out("b"), out("c")]),
        ],
    )
}

pub fn shell_worker(name: &str) -> WorkerProfile {
    WorkerProfile::new(name, SchedulerFamily::InteractiveShell)
}

pub fn local_worker(name: &str) -> WorkerProfile {
    WorkerProfile::new(name, SchedulerFamily::Local)
}

/// Batch worker whose default request satisfies the required fields.
pub fn batch_worker(name: &str) -> WorkerProfile {
    WorkerProfile::new(name, SchedulerFamily::BatchQueue)
        .with_default_resources(ResourceSpec::new().time(WallTime::from_minutes(10)))
}

pub fn exec_config(name: &str) -> ExecConfig {
    let mut config = ExecConfig::new(name);
    config.modules.push("python/3.11".to_string());
    config
        .export
        .insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    config
}

/// Short poll interval and near-zero backoff, so engine tests finish fast.
pub fn fast_options() -> EngineOptions {
    EngineOptions {
        poll_interval: Duration::from_millis(10),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            call_timeout: Duration::from_secs(1),
        },
    }
}

/// Builder for engines whose workers all share one [`FakeTransport`].
pub struct EngineFixture {
    transport: FakeTransport,
    workers: Vec<WorkerProfile>,
    exec_configs: Vec<ExecConfig>,
    store: Option<Arc<dyn SubmissionStore>>,
    options: EngineOptions,
}

impl EngineFixture {
    pub fn new(transport: FakeTransport) -> Self {
        Self {
            transport,
            workers: Vec::new(),
            exec_configs: Vec::new(),
            store: None,
            options: fast_options(),
        }
    }

    pub fn worker(mut self, profile: WorkerProfile) -> Self {
        self.workers.push(profile);
        self
    }

    pub fn exec_config(mut self, config: ExecConfig) -> Self {
        self.exec_configs.push(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn SubmissionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> SubmissionEngine {
        let mut builder = SubmissionEngine::builder(self.options);
        if let Some(store) = self.store {
            builder = builder.store(store);
        }
        for profile in self.workers {
            builder = builder.worker_with_transport(profile, Arc::new(self.transport.clone()));
        }
        for config in self.exec_configs {
            builder = builder.exec_config(config);
        }
        builder.build()
    }
}

/// Engine with a single shell worker named `local_shell`.
pub fn fake_engine(transport: &FakeTransport) -> SubmissionEngine {
    EngineFixture::new(transport.clone())
        .worker(shell_worker("local_shell"))
        .build()
}
