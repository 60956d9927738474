use std::future::Future;
use std::time::Duration;

use error_stack::Report;
use tokio::time::sleep;
use tracing::warn;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Fixed retry budget with capped exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the policy's exponential backoff.
    Backoff,
    /// Retry after the delay the remote side asked for.
    After(Duration),
    /// The failure is permanent.
    GiveUp,
}

/// Run `op` until it succeeds or `policy.max_retries` retries are used up.
///
/// The last error is returned with the attempt count attached.
pub async fn retry<T, C, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    op: F,
) -> Result<T, Report<C>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Report<C>>>,
    C: std::error::Error + Send + Sync + 'static,
{
    retry_when(policy, operation, op, |_| RetryDecision::Backoff).await
}

/// Like [`retry`], but `decide` chooses per failure whether and when to
/// try again.
pub async fn retry_when<T, C, F, Fut, D>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
    decide: D,
) -> Result<T, Report<C>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Report<C>>>,
    C: std::error::Error + Send + Sync + 'static,
    D: Fn(&Report<C>) -> RetryDecision,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let report = match op().await {
            Ok(value) => return Ok(value),
            Err(report) => report,
        };

        if attempt > policy.max_retries {
            return Err(report.attach(format!("gave up after {attempt} attempts")));
        }

        let delay = match decide(&report) {
            RetryDecision::GiveUp => {
                return Err(report.attach(format!("permanent failure on attempt {attempt}")));
            }
            RetryDecision::After(delay) => delay,
            RetryDecision::Backoff => {
                let delay = backoff;
                backoff = (backoff * 2).min(policy.max_backoff);
                delay
            }
        };

        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %report.current_context(),
            "attempt failed, retrying"
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ExchangeError;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn failure() -> Report<ExchangeError> {
        Report::new(ExchangeError::Request {
            endpoint: "test".into(),
        })
    }

    #[tokio::test]
    async fn returns_first_success_without_retrying() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast(3), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Report<ExchangeError>>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast(3), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(failure())
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&fast(2), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(failure())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_when(
            &fast(3),
            "op",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(failure())
            },
            |_| RetryDecision::GiveUp,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requested_delay_replaces_backoff() {
        let calls = AtomicU32::new(0);
        let started = std::time::Instant::now();
        let result = retry_when(
            &fast(3),
            "op",
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(failure())
                } else {
                    Ok(())
                }
            },
            |_| RetryDecision::After(Duration::from_millis(20)),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&fast(0), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(failure())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
