//! Bounded retry with a fixed backoff between attempts.
//!
//! The executor only knows whether an attempt succeeded or left something to
//! retry; what "something" is belongs to the operation.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// How many times to attempt an operation and how long to wait in between.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than one.
    pub max_attempts: u32,
    /// Delay after a retryable attempt before the next one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome<F> {
    Success,
    Retryable(F),
}

/// Result of the whole retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<F> {
    Succeeded { attempts: u32 },
    /// Every attempt was retryable; `last` is what the final attempt left.
    Exhausted { attempts: u32, last: F },
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// `operation` receives the 1-based attempt number. An `Err` from an attempt
/// stops the loop at once and is returned unchanged. No backoff follows the
/// final attempt.
pub async fn run_with_retry<F, E, Op, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: Op,
) -> Result<RetryOutcome<F>, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<AttemptOutcome<F>, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await? {
            AttemptOutcome::Success => {
                if attempt > 1 {
                    info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(RetryOutcome::Succeeded { attempts: attempt });
            }
            AttemptOutcome::Retryable(last) => {
                if attempt >= max_attempts {
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation still failing after max attempts"
                    );
                    return Ok(RetryOutcome::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    backoff_ms = policy.backoff.as_millis() as u64,
                    "Operation left work to retry, waiting before next attempt"
                );
                sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}
