#![allow(dead_code)]

pub use remoteflow_test_utils::builders::*;
pub use remoteflow_test_utils::fake_transport::FakeTransport;
pub use remoteflow_test_utils::{init_tracing, with_timeout};

use std::error::Error;

use remoteflow::engine::{FlowStatus, SubmissionEngine, SubmissionHandle};
use remoteflow::types::JobStatus;

pub type TestResult = Result<(), Box<dyn Error>>;

/// Submit `flow` to `local_shell` and wait for it (5s timeout).
pub async fn run_to_end(
    engine: &SubmissionEngine,
    flow: remoteflow::flow::Flow,
) -> Result<(SubmissionHandle, FlowStatus), Box<dyn Error>> {
    let handle = engine.submit(flow, "local_shell", None, None).await?;
    let status = with_timeout(engine.wait(&handle)).await?;
    Ok((handle, status))
}

/// Poll `status` until `job` reaches `expected` (5s timeout).
pub async fn wait_for_job(
    engine: &SubmissionEngine,
    handle: &SubmissionHandle,
    job: &str,
    expected: JobStatus,
) -> FlowStatus {
    with_timeout(async {
        loop {
            let status = engine.status(handle).await.expect("flow is known");
            if status.status_of(job) == Some(expected) {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
}
