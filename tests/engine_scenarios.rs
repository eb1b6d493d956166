// tests/engine_scenarios.rs
//
// End-to-end runs of the submission engine against the scripted transport.

mod common;
use crate::common::*;

use std::time::Duration;

use serde_json::json;

use remoteflow::engine::SubmissionHandle;
use remoteflow::errors::RemoteflowError;
use remoteflow::resources::ResourceSpec;
use remoteflow::types::JobStatus;

#[tokio::test]
async fn add_chain_runs_to_completion() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new();
    let engine = fake_engine(&transport);

    let (_, status) = run_to_end(&engine, add_chain("chain")).await?;

    assert!(status.finished);
    assert!(status.all_completed(), "{status:?}");
    assert_eq!(transport.dispatched(), vec!["a", "b"]);

    let b = transport.payload_of("b").expect("b was dispatched");
    assert_eq!(b.args, vec![json!(3), json!(3)]);
    assert_eq!(b.flow_id, "chain");
    Ok(())
}

#[tokio::test]
async fn diamond_dispatches_every_job_exactly_once() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().dispatch_delay(std::time::Duration::from_millis(15));
    let engine = fake_engine(&transport);

    let (_, status) = run_to_end(&engine, diamond("diamond")).await?;

    assert!(status.all_completed());
    for job in ["a", "b", "c", "d"] {
        assert_eq!(transport.dispatch_count(job), 1, "job {job}");
    }
    let dispatched = transport.dispatched();
    assert_eq!(dispatched.first().map(String::as_str), Some("a"));
    assert_eq!(dispatched.last().map(String::as_str), Some("d"));

    let d = transport.payload_of("d").unwrap();
    assert_eq!(d.args, vec![json!(12), json!(102)]);
    Ok(())
}

#[tokio::test]
async fn remote_failure_cancels_dependents() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().fail_job("a");
    let engine = fake_engine(&transport);

    let flow = flow_of(
        "fail",
        vec![
            add_job("a", vec![lit(1)]),
            add_job("b", vec![out("a")]),
            add_job("c", vec![out("b")]),
            add_job("side", vec![lit(2), lit(2)]),
        ],
    );
    let (_, status) = run_to_end(&engine, flow).await?;

    assert!(status.finished);
    assert_eq!(status.status_of("a"), Some(JobStatus::Failed));
    assert!(status.reason_of("a").unwrap().contains("boom"));
    assert_eq!(status.status_of("b"), Some(JobStatus::Cancelled));
    assert_eq!(status.status_of("c"), Some(JobStatus::Cancelled));
    assert!(status.reason_of("c").unwrap().contains("failed dependency 'a'"));
    assert_eq!(status.status_of("side"), Some(JobStatus::Completed));

    assert_eq!(transport.dispatch_count("b"), 0);
    assert_eq!(transport.dispatch_count("c"), 0);
    Ok(())
}

#[tokio::test]
async fn cancel_stops_running_and_pending_jobs() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().hang_job("a");
    let engine = fake_engine(&transport);

    let handle = engine.submit(add_chain("cancel"), "local_shell", None, None).await?;
    wait_for_job(&engine, &handle, "a", JobStatus::Running).await;

    let status = engine.cancel(&handle).await?;
    assert_eq!(status.status_of("a"), Some(JobStatus::Cancelled));
    assert_eq!(status.status_of("b"), Some(JobStatus::Cancelled));
    assert_eq!(status.reason_of("a"), Some("cancelled by operator"));
    assert_eq!(transport.cancelled(), vec!["a"]);

    let status = with_timeout(engine.wait(&handle)).await?;
    assert!(status.finished);
    assert_eq!(transport.dispatch_count("b"), 0);
    Ok(())
}

#[tokio::test]
async fn unconfirmed_cancel_keeps_job_active() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().hang_job("a").confirm_cancel(false);
    let engine = fake_engine(&transport);

    let handle = engine.submit(add_chain("stubborn"), "local_shell", None, None).await?;
    wait_for_job(&engine, &handle, "a", JobStatus::Running).await;

    let status = engine.cancel(&handle).await?;
    assert_eq!(status.status_of("a"), Some(JobStatus::Running));
    assert_eq!(status.status_of("b"), Some(JobStatus::Cancelled));
    assert!(!status.finished);

    // Polling goes on until the backend reports a terminal state.
    let polls = transport.poll_count();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(transport.poll_count() > polls);
    Ok(())
}

#[tokio::test]
async fn transient_dispatch_errors_are_retried() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().flaky_dispatch("a", 2);
    let engine = fake_engine(&transport);

    let (_, status) = run_to_end(&engine, add_chain("flaky")).await?;

    assert!(status.all_completed());
    assert_eq!(transport.dispatch_count("a"), 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_dispatch_retries_fail_the_job() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().flaky_dispatch("a", 10);
    let engine = fake_engine(&transport);

    let (_, status) = run_to_end(&engine, add_chain("down")).await?;

    assert_eq!(status.status_of("a"), Some(JobStatus::Failed));
    let reason = status.reason_of("a").unwrap();
    assert!(reason.contains("dispatch failed"), "{reason}");
    assert!(reason.contains("after 3 attempts"), "{reason}");
    assert_eq!(status.status_of("b"), Some(JobStatus::Cancelled));
    Ok(())
}

#[tokio::test]
async fn dispatch_that_times_out_is_never_sent_twice() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().stall_after_accept("a", Duration::from_secs(30));
    let mut options = fast_options();
    options.retry.call_timeout = Duration::from_millis(100);
    let engine = EngineFixture::new(transport.clone())
        .worker(shell_worker("local_shell"))
        .options(options)
        .build();

    let (_, status) = run_to_end(&engine, add_chain("slow-reply")).await?;

    assert_eq!(transport.dispatch_count("a"), 1);
    assert_eq!(status.status_of("a"), Some(JobStatus::Failed));
    let reason = status.reason_of("a").unwrap();
    assert!(reason.contains("timed out"), "{reason}");
    assert!(reason.contains("not retried"), "{reason}");
    assert_eq!(status.status_of("b"), Some(JobStatus::Cancelled));
    assert_eq!(transport.dispatch_count("b"), 0);
    Ok(())
}

#[tokio::test]
async fn unreachable_worker_fails_active_jobs() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().unreachable_polls();
    let engine = fake_engine(&transport);

    let (_, status) = run_to_end(&engine, add_chain("lost")).await?;

    assert_eq!(status.status_of("a"), Some(JobStatus::Failed));
    assert!(status.reason_of("a").unwrap().contains("lost contact"));
    assert_eq!(status.status_of("b"), Some(JobStatus::Cancelled));
    Ok(())
}

#[tokio::test]
async fn requeued_job_runs_again() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().fail_job("a");
    let engine = fake_engine(&transport);

    let flow = flow_of(
        "requeue",
        vec![add_job("a", vec![lit(1)]), add_job("b", vec![out("a")])],
    );
    let (handle, status) = run_to_end(&engine, flow).await?;
    assert_eq!(status.status_of("a"), Some(JobStatus::Failed));

    transport.recover_job("a");
    let status = engine.requeue(&handle, "a").await?;
    assert_eq!(status.status_of("a"), Some(JobStatus::Ready));
    assert!(!status.finished);

    let status = with_timeout(engine.wait(&handle)).await?;
    assert_eq!(status.status_of("a"), Some(JobStatus::Completed));
    // Dependents cancelled by the failure stay cancelled.
    assert_eq!(status.status_of("b"), Some(JobStatus::Cancelled));
    assert_eq!(transport.dispatch_count("a"), 2);

    let err = engine.requeue(&handle, "b").await.unwrap_err();
    assert!(matches!(err, RemoteflowError::InvalidTransition { .. }));
    Ok(())
}

#[tokio::test]
async fn invalid_flow_dispatches_nothing() {
    init_tracing();
    let transport = FakeTransport::new();
    let engine = fake_engine(&transport);

    let cyclic = flow_of(
        "cyclic",
        vec![add_job("a", vec![out("b")]), add_job("b", vec![out("a")])],
    );
    let err = engine.submit(cyclic, "local_shell", None, None).await.unwrap_err();
    assert!(matches!(err, RemoteflowError::Cycle { .. }));

    let dangling = flow_of("dangling", vec![add_job("a", vec![out("ghost")])]);
    let err = engine.submit(dangling, "local_shell", None, None).await.unwrap_err();
    assert!(err.is_validation());

    assert!(transport.dispatched().is_empty());
}

#[tokio::test]
async fn untranslatable_request_rejects_whole_flow() {
    init_tracing();
    let transport = FakeTransport::new();
    let engine = fake_engine(&transport);

    let err = engine
        .submit(
            add_chain("too-big"),
            "local_shell",
            Some(ResourceSpec::new().nodes(4)),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is_translation());
    assert!(transport.dispatched().is_empty());
}

#[tokio::test]
async fn unknown_worker_and_environment_are_rejected() {
    init_tracing();
    let transport = FakeTransport::new();
    let engine = fake_engine(&transport);

    let err = engine
        .submit(add_chain("w"), "nowhere", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteflowError::UnknownWorker(ref w) if w == "nowhere"));

    let err = engine
        .submit(add_chain("e"), "local_shell", None, Some("missing-env"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteflowError::UnknownExecConfig(_)));

    assert!(transport.dispatched().is_empty());
}

#[tokio::test]
async fn per_job_worker_override_uses_that_workers_directives() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new();
    let engine = EngineFixture::new(transport.clone())
        .worker(shell_worker("local_shell"))
        .worker(batch_worker("cluster"))
        .exec_config(exec_config("py311"))
        .build();

    let flow = flow_of(
        "mixed",
        vec![
            add_job("a", vec![lit(1), lit(2)]),
            add_job("b", vec![out("a"), lit(3)])
                .on_worker("cluster")
                .with_resources(ResourceSpec::new().tasks(4)),
        ],
    );
    let handle = engine
        .submit(flow, "local_shell", None, Some("py311"))
        .await?;
    let status = with_timeout(engine.wait(&handle)).await?;
    assert!(status.all_completed());

    let a = transport.script_of("a").unwrap();
    assert!(a.contains("# remoteflow job: add-a"));
    assert!(a.contains("module load python/3.11"));
    assert!(!a.contains("#SBATCH"));

    let b = transport.script_of("b").unwrap();
    assert!(b.contains("#SBATCH --ntasks=4"));
    assert!(b.contains("#SBATCH --time=00:10:00"));

    let records = engine.records(&handle).await?;
    let b_record = records.iter().find(|r| r.job_id == "b").unwrap();
    assert_eq!(b_record.worker, "cluster");
    assert_eq!(b_record.resources.tasks, Some(4));
    assert_eq!(b_record.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn duplicate_flow_id_is_rejected_while_known() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new();
    let engine = fake_engine(&transport);

    let (handle, _) = run_to_end(&engine, add_chain("same")).await?;
    let err = engine
        .submit(add_chain("same"), "local_shell", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteflowError::DuplicateId(_)));

    engine.purge(&handle).await?;
    let (_, status) = run_to_end(&engine, add_chain("same")).await?;
    assert!(status.all_completed());
    Ok(())
}

#[tokio::test]
async fn purge_refuses_unfinished_flow() -> TestResult {
    init_tracing();
    let transport = FakeTransport::new().hang_job("a");
    let engine = fake_engine(&transport);

    let handle = engine.submit(add_chain("busy"), "local_shell", None, None).await?;
    let err = engine.purge(&handle).await.unwrap_err();
    assert!(matches!(err, RemoteflowError::FlowActive(_)));

    engine.cancel(&handle).await?;
    with_timeout(engine.wait(&handle)).await?;
    engine.purge(&handle).await?;

    let err = engine.status(&handle).await.unwrap_err();
    assert!(matches!(err, RemoteflowError::UnknownSubmission(_)));
    Ok(())
}

#[tokio::test]
async fn status_of_unknown_flow_is_an_error() {
    let engine = fake_engine(&FakeTransport::new());
    let err = engine
        .status(&SubmissionHandle::new("never-submitted"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteflowError::UnknownSubmission(_)));
}
