// src/transport/retry.rs

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::{RemoteflowError, Result};

/// Timeout and retry settings for transport calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first call included. At least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Applied to every single attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time,
    /// capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Run `call` under `policy`.
///
/// Each attempt is bounded by `call_timeout`; a timeout counts as a
/// transport error. Only transport errors are retried. Once attempts are
/// exhausted the last error is returned as a `Transport` error naming `op`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &str, call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_loop(policy, op, None, call).await
}

/// Like [`with_retry`], for calls that must not take effect twice.
///
/// A call that times out may still have gone through on the other side, so
/// a timeout ends the retries with a `RemoteExecution` error for `job`.
/// Transport errors returned by the call itself are retried as usual.
pub async fn with_retry_at_most_once<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    job: &str,
    call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_loop(policy, op, Some(job), call).await
}

/// `no_retry_after_timeout` names the job to blame when a timed-out attempt
/// must not be repeated.
async fn retry_loop<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    no_retry_after_timeout: Option<&str>,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => match no_retry_after_timeout {
                Some(job) => {
                    warn!(op = %op, attempt, "call timed out; outcome unknown, not retrying");
                    return Err(RemoteflowError::RemoteExecution {
                        job: job.to_string(),
                        diagnostic: format!(
                            "{op} timed out after {:?}; not retried because the worker may have accepted it",
                            policy.call_timeout
                        ),
                    });
                }
                None => Err(RemoteflowError::Transport(format!(
                    "timed out after {:?}",
                    policy.call_timeout
                ))),
            },
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            return Err(RemoteflowError::Transport(format!(
                "{op} failed after {attempt} attempts: {}",
                transport_message(&err)
            )));
        }

        let backoff = policy.backoff_for(attempt);
        warn!(
            op = %op,
            attempt,
            max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "transport call failed; retrying"
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

fn transport_message(err: &RemoteflowError) -> String {
    match err {
        RemoteflowError::Transport(msg) => msg.clone(),
        other => other.to_string(),
    }
}
