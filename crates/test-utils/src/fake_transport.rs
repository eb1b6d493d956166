use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use remoteflow::errors::RemoteflowError;
use remoteflow::flow::{DEFAULT_SLOT, OutputMap};
use remoteflow::transport::{
    DispatchRequest, JobPayload, RemoteHandle, RemoteState, RemoteTransport, TransportFuture,
};

/// A scripted transport that:
/// - records every dispatch, poll and cancel
/// - evaluates `*.add` callables by summing their arguments
/// - reports `Running` on the first poll and the final state on the second
///
/// Individual jobs can be made to fail, hang, or have their dispatch fail
/// transiently a number of times.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    jobs: HashMap<String, FakeJob>,
    dispatched: Vec<String>,
    scripts: HashMap<String, String>,
    payloads: HashMap<String, JobPayload>,
    polls: usize,
    cancelled: Vec<String>,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    outputs: HashMap<String, OutputMap>,
    dispatch_failures: HashMap<String, u32>,
    poll_failures: u32,
    confirm_cancel: bool,
    dispatch_delay: Option<Duration>,
    stall_after_accept: HashMap<String, Duration>,
}

struct FakeJob {
    job_id: String,
    polls: u32,
    result: RemoteState,
    cancelled: bool,
}

impl FakeTransport {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().confirm_cancel = true;
        fake
    }

    /// Job finishes with `Failed`.
    pub fn fail_job(self, job: &str) -> Self {
        self.state.lock().unwrap().failing.insert(job.to_string());
        self
    }

    /// Later dispatches of `job` succeed again.
    pub fn recover_job(&self, job: &str) {
        self.state.lock().unwrap().failing.remove(job);
    }

    /// Job stays `Running` until cancelled.
    pub fn hang_job(self, job: &str) -> Self {
        self.state.lock().unwrap().hanging.insert(job.to_string());
        self
    }

    /// A hanging job reports its final state from the next poll on.
    pub fn release_job(&self, job: &str) {
        self.state.lock().unwrap().hanging.remove(job);
    }

    /// Job publishes `outputs` instead of the computed sum.
    pub fn with_outputs(self, job: &str, outputs: OutputMap) -> Self {
        self.state
            .lock()
            .unwrap()
            .outputs
            .insert(job.to_string(), outputs);
        self
    }

    /// The first `times` dispatches of `job` fail with a transport error.
    pub fn flaky_dispatch(self, job: &str, times: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .dispatch_failures
            .insert(job.to_string(), times);
        self
    }

    /// Every poll fails with a transport error.
    pub fn unreachable_polls(self) -> Self {
        self.state.lock().unwrap().poll_failures = u32::MAX;
        self
    }

    /// Whether cancel requests are confirmed (default: yes).
    pub fn confirm_cancel(self, confirm: bool) -> Self {
        self.state.lock().unwrap().confirm_cancel = confirm;
        self
    }

    /// The first dispatch of `job` is accepted and recorded, then the reply
    /// is held back for `delay`.
    pub fn stall_after_accept(self, job: &str, delay: Duration) -> Self {
        self.state
            .lock()
            .unwrap()
            .stall_after_accept
            .insert(job.to_string(), delay);
        self
    }

    pub fn dispatch_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().dispatch_delay = Some(delay);
        self
    }

    /// Successful dispatches, in order.
    pub fn dispatched(&self) -> Vec<String> {
        self.state.lock().unwrap().dispatched.clone()
    }

    pub fn dispatch_count(&self, job: &str) -> usize {
        self.dispatched().iter().filter(|j| *j == job).count()
    }

    pub fn script_of(&self, job: &str) -> Option<String> {
        self.state.lock().unwrap().scripts.get(job).cloned()
    }

    pub fn payload_of(&self, job: &str) -> Option<JobPayload> {
        self.state.lock().unwrap().payloads.get(job).cloned()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().unwrap().polls
    }
}

/// Sum of numeric arguments, `null` when there is any other argument.
fn evaluate(payload: &JobPayload) -> OutputMap {
    let value = if payload.callable.ends_with("add") {
        let ints: Option<Vec<i64>> = payload.args.iter().map(Value::as_i64).collect();
        match ints {
            Some(ints) => json!(ints.iter().sum::<i64>()),
            None => {
                let floats: Option<Vec<f64>> = payload.args.iter().map(Value::as_f64).collect();
                floats.map(|f| json!(f.iter().sum::<f64>())).unwrap_or(Value::Null)
            }
        }
    } else {
        payload.args.first().cloned().unwrap_or(Value::Null)
    };
    OutputMap::from([(DEFAULT_SLOT.to_string(), value)])
}

impl FakeTransport {
    /// Record a dispatch and create its fake job. Also returns the stall to
    /// apply before replying, if any.
    fn accept(
        &self,
        request: &DispatchRequest,
    ) -> Result<(RemoteHandle, Option<Duration>), RemoteflowError> {
        let mut state = self.state.lock().unwrap();
        let job = request.job_id.clone();

        if let Some(left) = state.dispatch_failures.get_mut(&job) {
            if *left > 0 {
                *left -= 1;
                return Err(RemoteflowError::Transport(format!(
                    "connection reset while submitting {job}"
                )));
            }
        }

        let result = if state.failing.contains(&job) {
            RemoteState::Failed {
                diagnostic: "exit code 1: Traceback: boom".to_string(),
            }
        } else {
            let outputs = state
                .outputs
                .get(&job)
                .cloned()
                .unwrap_or_else(|| evaluate(&request.payload));
            RemoteState::Completed { outputs }
        };

        state.next_id += 1;
        let handle = RemoteHandle::new(format!("fake-{}", state.next_id));
        state.jobs.insert(
            handle.id.clone(),
            FakeJob {
                job_id: job.clone(),
                polls: 0,
                result,
                cancelled: false,
            },
        );
        state.dispatched.push(job.clone());
        state.scripts.insert(job.clone(), request.script.clone());
        state.payloads.insert(job.clone(), request.payload.clone());
        let stall = state.stall_after_accept.remove(&job);
        Ok((handle, stall))
    }
}

impl RemoteTransport for FakeTransport {
    fn dispatch<'a>(&'a self, request: &'a DispatchRequest) -> TransportFuture<'a, RemoteHandle> {
        Box::pin(async move {
            let delay = self.state.lock().unwrap().dispatch_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let (handle, stall) = self.accept(request)?;
            if let Some(stall) = stall {
                tokio::time::sleep(stall).await;
            }
            Ok(handle)
        })
    }

    fn poll<'a>(&'a self, handle: &'a RemoteHandle) -> TransportFuture<'a, RemoteState> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.polls += 1;
            if state.poll_failures > 0 {
                state.poll_failures -= 1;
                return Err(RemoteflowError::Transport("ssh: connect timed out".to_string()));
            }

            let hanging = state.hanging.clone();
            let Some(job) = state.jobs.get_mut(&handle.id) else {
                return Err(RemoteflowError::RemoteExecution {
                    job: handle.id.clone(),
                    diagnostic: "unknown handle".to_string(),
                });
            };

            job.polls += 1;
            if job.cancelled {
                return Ok(RemoteState::Cancelled);
            }
            if job.polls == 1 || hanging.contains(&job.job_id) {
                return Ok(RemoteState::Running);
            }
            Ok(job.result.clone())
        })
    }

    fn cancel<'a>(&'a self, handle: &'a RemoteHandle) -> TransportFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let confirm = state.confirm_cancel;
            let Some(job) = state.jobs.get_mut(&handle.id) else {
                return Ok(false);
            };
            if confirm {
                job.cancelled = true;
            }
            let job_id = job.job_id.clone();
            state.cancelled.push(job_id);
            Ok(confirm)
        })
    }
}
