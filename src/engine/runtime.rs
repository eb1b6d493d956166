// src/engine/runtime.rs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::{Id as TaskId, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::dag::DependencyResolver;
use crate::errors::{RemoteflowError, Result};
use crate::flow::Flow;
use crate::resources::{ExecConfig, ResourceSpec, WorkerProfile};
use crate::store::{LogEntry, MemoryStore, SubmissionRecord, SubmissionStore};
use crate::transport::{
    RemoteTransport, RetryPolicy, transport_for, with_retry, with_retry_at_most_once,
};
use crate::types::{FlowId, JobId};

use super::core::FlowRun;
use super::plan::{JobPlan, plan_flow};
use super::{
    CoreStep, DispatchOrder, EngineCommand, EngineEvent, FlowStatus, RemoteJobRef,
    SubmissionHandle,
};

/// Timing settings of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Delay between two poll rounds of a flow with active jobs.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&EngineSettings> for EngineOptions {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            retry: settings.retry,
        }
    }
}

/// Registers workers, environments and the store of a [`SubmissionEngine`].
pub struct EngineBuilder {
    options: EngineOptions,
    profiles: BTreeMap<String, WorkerProfile>,
    transports: BTreeMap<String, Arc<dyn RemoteTransport>>,
    exec_configs: BTreeMap<String, ExecConfig>,
    store: Option<Arc<dyn SubmissionStore>>,
}

impl EngineBuilder {
    fn new(options: EngineOptions) -> Self {
        Self {
            options,
            profiles: BTreeMap::new(),
            transports: BTreeMap::new(),
            exec_configs: BTreeMap::new(),
            store: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn SubmissionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a worker reached through the default transport of its
    /// scheduler family.
    pub fn worker(self, profile: WorkerProfile) -> Self {
        let transport = transport_for(&profile);
        self.worker_with_transport(profile, transport)
    }

    pub fn worker_with_transport(
        mut self,
        profile: WorkerProfile,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        self.transports.insert(profile.name.clone(), transport);
        self.profiles.insert(profile.name.clone(), profile);
        self
    }

    pub fn exec_config(mut self, config: ExecConfig) -> Self {
        self.exec_configs.insert(config.name.clone(), config);
        self
    }

    pub fn build(self) -> SubmissionEngine {
        info!(
            workers = self.profiles.len(),
            exec_configs = self.exec_configs.len(),
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "submission engine ready"
        );
        SubmissionEngine {
            inner: Arc::new(EngineInner {
                profiles: self.profiles,
                transports: self.transports,
                exec_configs: self.exec_configs,
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(MemoryStore::new())),
                options: self.options,
                flows: Mutex::new(FlowTable::default()),
            }),
        }
    }
}

/// Submits flows to workers and follows them to completion.
///
/// This is the async IO shell around [`FlowRun`], which holds all the
/// submission semantics. Each submitted flow gets:
/// - its own `FlowRun` behind a lock,
/// - a monitoring task that polls active jobs every `poll_interval`,
/// - a completion signal that [`SubmissionEngine::wait`] listens to.
///
/// Transport calls run as tasks; their results are stepped into the run one
/// at a time, and the resulting log entries are persisted before the lock is
/// released.
#[derive(Clone)]
pub struct SubmissionEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for SubmissionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionEngine")
            .field("workers", &self.inner.profiles.keys().collect::<Vec<_>>())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

struct EngineInner {
    profiles: BTreeMap<String, WorkerProfile>,
    transports: BTreeMap<String, Arc<dyn RemoteTransport>>,
    exec_configs: BTreeMap<String, ExecConfig>,
    store: Arc<dyn SubmissionStore>,
    options: EngineOptions,
    flows: Mutex<FlowTable>,
}

/// Flows known to this engine. An id is reserved while its flow is being
/// set up, so two submissions of the same id cannot both get through.
#[derive(Default)]
struct FlowTable {
    active: HashMap<FlowId, Arc<ActiveFlow>>,
    reserved: HashSet<FlowId>,
}

struct ActiveFlow {
    run: tokio::sync::Mutex<FlowRun>,
    /// Cuts the current poll delay short.
    wake: Notify,
    done: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveFlow {
    fn new(run: FlowRun, finished: bool) -> Self {
        let (done, _) = watch::channel(finished);
        Self {
            run: tokio::sync::Mutex::new(run),
            wake: Notify::new(),
            done,
            monitor: Mutex::new(None),
        }
    }

    fn publish(&self, step: &CoreStep) {
        self.done.send_replace(step.finished);
    }
}

impl SubmissionEngine {
    pub fn builder(options: EngineOptions) -> EngineBuilder {
        EngineBuilder::new(options)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.inner.store
    }

    /// Plan every job of `flow` without submitting anything.
    pub fn plan(
        &self,
        flow: &Flow,
        worker: &str,
        resources: &ResourceSpec,
        exec_config: Option<&str>,
    ) -> Result<BTreeMap<JobId, JobPlan>> {
        plan_flow(
            flow,
            worker,
            resources,
            exec_config,
            &self.inner.profiles,
            &self.inner.exec_configs,
        )
    }

    /// Validate, plan and start `flow` on `worker`.
    ///
    /// Nothing is dispatched when the flow is invalid or any of its jobs
    /// cannot be planned. Jobs without inputs are dispatched right away; the
    /// rest follow as their producers complete.
    pub async fn submit(
        &self,
        flow: Flow,
        worker: &str,
        resources: Option<ResourceSpec>,
        exec_config: Option<&str>,
    ) -> Result<SubmissionHandle> {
        flow.validate()?;
        let resources = resources.unwrap_or_default();
        resources.validate()?;

        let plans = self.plan(&flow, worker, &resources, exec_config)?;
        let mut run = FlowRun::new(&flow, plans)?;
        let flow_id = flow.id.clone();

        let reservation = self.inner.reserve(&flow_id)?;
        if self.inner.store.is_recorded(&flow_id)? {
            // Submitted before, possibly by an earlier process.
            return Err(RemoteflowError::DuplicateId(flow_id));
        }

        let now = Utc::now();
        self.inner.store.append(&LogEntry::FlowSubmitted {
            flow_id: flow_id.clone(),
            flow,
            worker: worker.to_string(),
            resources,
            exec_config: exec_config.map(str::to_string),
            at: now,
        })?;

        let step = run.start(now);
        self.inner.persist(&step.log);
        info!(
            flow = %flow_id,
            worker = %worker,
            jobs = run.resolver().graph().len(),
            initial = step.dispatched_jobs().len(),
            "flow submitted"
        );

        let active = Arc::new(ActiveFlow::new(run, step.finished));
        reservation.activate(active.clone())?;
        self.spawn_monitor(active, step.commands);

        Ok(SubmissionHandle::new(flow_id))
    }

    /// Rebuild a flow from the transition log and carry on with it.
    ///
    /// Active jobs are polled immediately; `Ready` jobs that never reached
    /// a worker are dispatched again.
    pub async fn resume(&self, flow_id: &str) -> Result<SubmissionHandle> {
        if self.inner.lookup(flow_id)?.is_some() {
            debug!(flow = %flow_id, "flow already active; nothing to resume");
            return Ok(SubmissionHandle::new(flow_id));
        }

        let reservation = self.inner.reserve(flow_id)?;
        let replayed = self.inner.store.replay(flow_id)?;
        let plans = self.plan(
            &replayed.flow,
            &replayed.worker,
            &replayed.resources,
            replayed.exec_config.as_deref(),
        )?;
        let mut run = FlowRun::new(&replayed.flow, plans)?;
        run.restore(&replayed)?;

        let step = run.resume_step(Utc::now());
        self.inner.persist(&step.log);
        info!(
            flow = %flow_id,
            active = run.active_jobs().len(),
            redispatched = step.dispatched_jobs().len(),
            finished = step.finished,
            "flow resumed"
        );

        let active = Arc::new(ActiveFlow::new(run, step.finished));
        reservation.activate(active.clone())?;
        self.spawn_monitor(active, step.commands);

        Ok(SubmissionHandle::new(flow_id))
    }

    /// Current state of every job of the flow.
    ///
    /// Flows that are not active in this engine are rebuilt from the log.
    pub async fn status(&self, handle: &SubmissionHandle) -> Result<FlowStatus> {
        match self.inner.lookup(&handle.flow_id)? {
            Some(active) => Ok(active.run.lock().await.snapshot()),
            None => self.status_from_log(&handle.flow_id),
        }
    }

    /// Submission records of the flow's dispatched jobs.
    pub async fn records(&self, handle: &SubmissionHandle) -> Result<Vec<SubmissionRecord>> {
        match self.inner.lookup(&handle.flow_id)? {
            Some(active) => Ok(active.run.lock().await.records().values().cloned().collect()),
            None => Ok(self
                .inner
                .store
                .replay(&handle.flow_id)?
                .records
                .into_values()
                .collect()),
        }
    }

    /// Cancel the whole flow.
    ///
    /// Jobs not yet dispatched are cancelled at once. Active jobs get a
    /// remote cancel; those the backend confirms are cancelled, the others
    /// keep being polled until they reach a terminal state.
    pub async fn cancel(&self, handle: &SubmissionHandle) -> Result<FlowStatus> {
        let active = self.inner.require(&handle.flow_id)?;

        let step = {
            let mut run = active.run.lock().await;
            let step = run.cancel(Utc::now());
            self.inner.persist(&step.log);
            active.publish(&step);
            step
        };
        info!(flow = %handle, "flow cancel requested");

        drive(&self.inner, &active, step.commands).await;
        active.wake.notify_one();

        Ok(active.run.lock().await.snapshot())
    }

    /// Put a `Failed` job back in line.
    pub async fn requeue(&self, handle: &SubmissionHandle, job: &str) -> Result<FlowStatus> {
        let active = self.inner.require(&handle.flow_id)?;

        let (step, status) = {
            let mut run = active.run.lock().await;
            let step = run.requeue(job, Utc::now())?;
            self.inner.persist(&step.log);
            active.publish(&step);
            (step, run.snapshot())
        };

        let inner = self.inner.clone();
        let flow = active.clone();
        tokio::spawn(async move {
            drive(&inner, &flow, step.commands).await;
            flow.wake.notify_one();
        });

        Ok(status)
    }

    /// Wait until every job of the flow is terminal.
    pub async fn wait(&self, handle: &SubmissionHandle) -> Result<FlowStatus> {
        let active = self.inner.require(&handle.flow_id)?;
        let mut done = active.done.subscribe();
        done.wait_for(|finished| *finished)
            .await
            .map_err(|e| RemoteflowError::Other(anyhow::anyhow!("completion signal lost: {e}")))?;
        Ok(active.run.lock().await.snapshot())
    }

    /// Forget a finished flow, in memory and in the store.
    pub async fn purge(&self, handle: &SubmissionHandle) -> Result<()> {
        if let Some(active) = self.inner.lookup(&handle.flow_id)? {
            if !active.run.lock().await.is_finished() {
                return Err(RemoteflowError::FlowActive(handle.flow_id.clone()));
            }
            if let Some(monitor) = lock(&active.monitor)?.take() {
                monitor.abort();
            }
            self.inner.remove(&handle.flow_id)?;
        }

        self.inner.store.purge(&handle.flow_id)?;
        info!(flow = %handle, "flow purged");
        Ok(())
    }

    fn status_from_log(&self, flow_id: &str) -> Result<FlowStatus> {
        let replayed = self.inner.store.replay(flow_id)?;
        let mut resolver = DependencyResolver::new(&replayed.flow)?;
        for (id, job) in &replayed.jobs {
            resolver.restore(id, job.status, job.reason.clone(), job.outputs.clone())?;
        }
        Ok(FlowStatus {
            flow_id: flow_id.to_string(),
            name: replayed.flow.name.clone(),
            jobs: resolver.snapshot(),
            finished: resolver.is_finished(),
        })
    }

    fn spawn_monitor(&self, flow: Arc<ActiveFlow>, initial: Vec<EngineCommand>) {
        let task = tokio::spawn(monitor(self.inner.clone(), flow.clone(), initial));
        match lock(&flow.monitor) {
            Ok(mut slot) => *slot = Some(task),
            Err(e) => error!(error = %e, "could not record monitor task"),
        }
    }
}

/// Per-flow loop: carry out the initial commands, then poll active jobs
/// every `poll_interval` (or when woken). A finished flow parks until it is
/// woken by a requeue.
async fn monitor(inner: Arc<EngineInner>, flow: Arc<ActiveFlow>, initial: Vec<EngineCommand>) {
    drive(&inner, &flow, initial).await;

    loop {
        let finished = {
            let run = flow.run.lock().await;
            let finished = run.is_finished();
            if finished {
                flow.done.send_replace(true);
                debug!(flow = %run.flow_id(), "flow finished; monitor parked");
            }
            finished
        };

        if finished {
            flow.wake.notified().await;
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.options.poll_interval) => {}
            _ = flow.wake.notified() => {}
        }

        let commands = flow.run.lock().await.poll_step().commands;
        drive(&inner, &flow, commands).await;
    }
}

/// Execute `commands` and every command they lead to, until no transport
/// call is outstanding.
async fn drive(inner: &Arc<EngineInner>, flow: &Arc<ActiveFlow>, commands: Vec<EngineCommand>) {
    let mut tasks: JoinSet<EngineEvent> = JoinSet::new();
    let mut fallbacks: HashMap<TaskId, EngineEvent> = HashMap::new();
    spawn_commands(inner, commands, &mut tasks, &mut fallbacks);

    while let Some(joined) = tasks.join_next_with_id().await {
        let event = match joined {
            Ok((id, event)) => {
                fallbacks.remove(&id);
                event
            }
            Err(e) => {
                error!(error = %e, "transport task did not complete");
                match fallbacks.remove(&e.id()) {
                    Some(event) => event,
                    None => continue,
                }
            }
        };

        let step = {
            let mut run = flow.run.lock().await;
            let step = run.step(event, Utc::now());
            inner.persist(&step.log);
            flow.publish(&step);
            step
        };
        spawn_commands(inner, step.commands, &mut tasks, &mut fallbacks);
    }
}

fn spawn_commands(
    inner: &Arc<EngineInner>,
    commands: Vec<EngineCommand>,
    tasks: &mut JoinSet<EngineEvent>,
    fallbacks: &mut HashMap<TaskId, EngineEvent>,
) {
    for command in commands {
        match command {
            EngineCommand::Dispatch(orders) => {
                for order in orders {
                    let fallback = EngineEvent::DispatchFailed {
                        job: order.job.clone(),
                        error: "dispatch task aborted".to_string(),
                    };
                    let inner = inner.clone();
                    let handle = tasks.spawn(async move { inner.dispatch(order).await });
                    fallbacks.insert(handle.id(), fallback);
                }
            }
            EngineCommand::Poll(targets) => {
                for target in targets {
                    let fallback = EngineEvent::PollFailed {
                        job: target.job.clone(),
                        error: "poll task aborted".to_string(),
                    };
                    let inner = inner.clone();
                    let handle = tasks.spawn(async move { inner.poll(target).await });
                    fallbacks.insert(handle.id(), fallback);
                }
            }
            EngineCommand::CancelRemote(targets) => {
                for target in targets {
                    let fallback = EngineEvent::CancelAcknowledged {
                        job: target.job.clone(),
                        confirmed: false,
                    };
                    let inner = inner.clone();
                    let handle = tasks.spawn(async move { inner.cancel(target).await });
                    fallbacks.insert(handle.id(), fallback);
                }
            }
        }
    }
}

impl EngineInner {
    fn transport(&self, worker: &str) -> Result<&dyn RemoteTransport> {
        self.transports
            .get(worker)
            .map(|t| t.as_ref())
            .ok_or_else(|| RemoteflowError::UnknownWorker(worker.to_string()))
    }

    async fn dispatch(&self, order: DispatchOrder) -> EngineEvent {
        let result = match self.transport(&order.worker) {
            Ok(transport) => {
                let request = &order.request;
                let op = format!("dispatch of job {}", order.job);
                with_retry_at_most_once(&self.options.retry, &op, &order.job, move || {
                    transport.dispatch(request)
                })
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(handle) => EngineEvent::Dispatched {
                job: order.job,
                handle,
            },
            Err(e) => EngineEvent::DispatchFailed {
                job: order.job,
                error: e.to_string(),
            },
        }
    }

    async fn poll(&self, target: RemoteJobRef) -> EngineEvent {
        let result = match self.transport(&target.worker) {
            Ok(transport) => {
                let handle = &target.handle;
                let op = format!("poll of job {}", target.job);
                with_retry(&self.options.retry, &op, move || transport.poll(handle)).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(state) => EngineEvent::Polled {
                job: target.job,
                state,
            },
            Err(e) => EngineEvent::PollFailed {
                job: target.job,
                error: e.to_string(),
            },
        }
    }

    async fn cancel(&self, target: RemoteJobRef) -> EngineEvent {
        let result = match self.transport(&target.worker) {
            Ok(transport) => {
                let handle = &target.handle;
                let op = format!("cancel of job {}", target.job);
                with_retry(&self.options.retry, &op, move || transport.cancel(handle)).await
            }
            Err(e) => Err(e),
        };

        let confirmed = match result {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(job = %target.job, error = %e, "remote cancel failed");
                false
            }
        };
        EngineEvent::CancelAcknowledged {
            job: target.job,
            confirmed,
        }
    }

    /// Append `log` to the store. Failures are logged; the in-memory state
    /// stays authoritative for this process.
    fn persist(&self, log: &[LogEntry]) {
        for entry in log {
            if let Err(e) = self.store.append(entry) {
                error!(flow = %entry.flow_id(), error = %e, "failed to persist log entry");
            }
        }
    }

    fn lookup(&self, flow_id: &str) -> Result<Option<Arc<ActiveFlow>>> {
        Ok(lock(&self.flows)?.active.get(flow_id).cloned())
    }

    fn require(&self, flow_id: &str) -> Result<Arc<ActiveFlow>> {
        self.lookup(flow_id)?
            .ok_or_else(|| RemoteflowError::UnknownSubmission(flow_id.to_string()))
    }

    /// Claim `flow_id` for a flow about to be set up. The claim is released
    /// when the returned guard is dropped without being activated.
    fn reserve(&self, flow_id: &str) -> Result<Reservation<'_>> {
        let mut flows = lock(&self.flows)?;
        if flows.active.contains_key(flow_id) || !flows.reserved.insert(flow_id.to_string()) {
            return Err(RemoteflowError::DuplicateId(flow_id.to_string()));
        }
        Ok(Reservation {
            inner: self,
            flow_id: flow_id.to_string(),
        })
    }

    fn remove(&self, flow_id: &str) -> Result<()> {
        lock(&self.flows)?.active.remove(flow_id);
        Ok(())
    }
}

struct Reservation<'a> {
    inner: &'a EngineInner,
    flow_id: FlowId,
}

impl Reservation<'_> {
    /// Turn the claim into a registered flow.
    fn activate(self, flow: Arc<ActiveFlow>) -> Result<()> {
        let mut flows = lock(&self.inner.flows)?;
        flows.reserved.remove(&self.flow_id);
        flows.active.insert(self.flow_id.clone(), flow);
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut flows) = self.inner.flows.lock() {
            flows.reserved.remove(&self.flow_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| RemoteflowError::Other(anyhow::anyhow!("engine lock poisoned")))
}
