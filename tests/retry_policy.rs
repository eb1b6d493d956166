// tests/retry_policy.rs

mod common;
use crate::common::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;

use remoteflow::errors::RemoteflowError;
use remoteflow::transport::slurm::{SlurmState, classify_state, parse_job_id};
use remoteflow::transport::{RetryPolicy, parse_outputs, with_retry, with_retry_at_most_once};

fn quick(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        call_timeout: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() -> TestResult {
    init_tracing();
    let calls = Arc::new(AtomicU32::new(0));

    let value = with_timeout(with_retry(&quick(3), "dispatch of job a", || {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RemoteflowError::Transport("connection reset".to_string()))
            } else {
                Ok(7)
            }
        }
    }))
    .await?;

    assert_eq!(value, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn permanent_errors_are_not_retried() -> TestResult {
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = with_retry(&quick(5), "dispatch of job a", || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteflowError::RemoteExecution {
                job: "a".to_string(),
                diagnostic: "sbatch: error: invalid account".to_string(),
            })
        }
    })
    .await;

    assert!(matches!(result, Err(RemoteflowError::RemoteExecution { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_name_the_operation() -> TestResult {
    let result: Result<(), _> = with_retry(&quick(2), "poll of job b", || async {
        Err(RemoteflowError::Transport("ssh: connect timed out".to_string()))
    })
    .await;

    let err = result.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(
        err.to_string(),
        "Transport error: poll of job b failed after 2 attempts: ssh: connect timed out"
    );
    Ok(())
}

#[tokio::test]
async fn slow_calls_time_out_per_attempt() -> TestResult {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy {
        call_timeout: Duration::from_millis(20),
        ..quick(2)
    };

    let result: Result<(), _> = with_timeout(with_retry(&policy, "cancel of job c", || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }))
    .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("timed out after"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn at_most_once_calls_stop_after_a_timeout() -> TestResult {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy {
        call_timeout: Duration::from_millis(20),
        ..quick(3)
    };

    let result: Result<(), _> = with_timeout(with_retry_at_most_once(
        &policy,
        "dispatch of job a",
        "a",
        || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        },
    ))
    .await;

    match result {
        Err(RemoteflowError::RemoteExecution { job, diagnostic }) => {
            assert_eq!(job, "a");
            assert!(diagnostic.contains("timed out after"), "{diagnostic}");
        }
        other => panic!("expected RemoteExecution, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn at_most_once_calls_still_retry_refused_connections() -> TestResult {
    let calls = Arc::new(AtomicU32::new(0));

    let value = with_timeout(with_retry_at_most_once(&quick(3), "dispatch of job a", "a", || {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RemoteflowError::Transport("ssh: connection refused".to_string()))
            } else {
                Ok("4242")
            }
        }
    }))
    .await?;

    assert_eq!(value, "4242");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn backoff_doubles_and_caps() {
    let policy = RetryPolicy {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(500),
        call_timeout: Duration::from_secs(1),
    };
    assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
    assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
    assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
    assert_eq!(policy.backoff_for(64), Duration::from_millis(500));
}

#[test]
fn outputs_come_from_last_stdout_line() {
    let out = parse_outputs("loading modules\n{\"energy\": -1.5, \"converged\": true}\n\n");
    assert_eq!(out.get("energy"), Some(&json!(-1.5)));
    assert_eq!(out.get("converged"), Some(&json!(true)));

    let scalar = parse_outputs("42\n");
    assert_eq!(scalar.get("output"), Some(&json!(42)));

    let text = parse_outputs("done\n");
    assert_eq!(text.get("output"), Some(&json!("done")));
}

#[test]
fn slurm_states_are_classified() {
    assert_eq!(classify_state("PENDING"), SlurmState::Queued);
    assert_eq!(classify_state("RUNNING"), SlurmState::Running);
    assert_eq!(classify_state("COMPLETED"), SlurmState::Completed);
    assert_eq!(classify_state("CANCELLED by 1000"), SlurmState::Cancelled);
    assert_eq!(classify_state("CANCELLED+"), SlurmState::Cancelled);
    assert_eq!(classify_state("OUT_OF_MEMORY"), SlurmState::Failed);
    assert_eq!(classify_state("TIMEOUT"), SlurmState::Failed);
    assert_eq!(classify_state(""), SlurmState::Queued);
}

#[test]
fn sbatch_job_ids_are_parsed() {
    assert_eq!(parse_job_id("123456\n").as_deref(), Some("123456"));
    assert_eq!(parse_job_id("98765;cluster-a\n").as_deref(), Some("98765"));
    assert_eq!(parse_job_id("sbatch: error: Batch job submission failed"), None);
    assert_eq!(parse_job_id(""), None);
}
