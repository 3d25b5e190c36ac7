//! Retrying operations with exponential backoff.

use std::{future::Future, sync::Mutex, time::Duration};

use tokio::time::Instant;
use tracing::debug;

use crate::{PeerpodError, PeerpodResult};

use ::backoff::backoff::Backoff;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::ExponentialBackoff;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The first delay between attempts.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(100);

/// The longest delay between attempts.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(5);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// A policy doubling the delay from `initial_interval` up to `max_interval`, with no limit on the
/// total time spent.
pub fn exponential_policy(initial_interval: Duration, max_interval: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// The policy used to reach peers that may take a while to come up.
pub fn default_policy() -> ExponentialBackoff {
    exponential_policy(DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_INTERVAL)
}

/// A policy polling every `interval`.
pub fn fixed_policy(interval: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: interval,
        initial_interval: interval,
        randomization_factor: 0.0,
        multiplier: 1.0,
        max_interval: interval,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Runs `operation` under `policy` until it succeeds or `timeout` has passed.
///
/// Every failure is retried. Attempts still running at the deadline are abandoned, and the last
/// error is reported as [`PeerpodError::DeadlineExceeded`].
pub async fn retry_until<T, F, Fut>(
    what: &str,
    timeout: Duration,
    policy: ExponentialBackoff,
    mut operation: F,
) -> PeerpodResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PeerpodResult<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut policy = ExponentialBackoff {
        max_elapsed_time: Some(timeout),
        ..policy
    };
    policy.reset();
    let last_error = Mutex::new(None::<String>);

    let attempt = || {
        let attempt = tokio::time::timeout_at(deadline, operation());
        async move {
            match attempt.await {
                Ok(result) => result.map_err(BackoffError::transient),
                Err(_) => Err(BackoffError::transient(PeerpodError::DeadlineExceeded(
                    "attempt timed out".into(),
                ))),
            }
        }
    };
    let notify = |error: PeerpodError, delay: Duration| {
        debug!(what, %error, ?delay, "retrying");
        if let Ok(mut last) = last_error.lock() {
            *last = Some(error.to_string());
        }
    };

    match tokio::time::timeout_at(deadline, retry_notify(policy, attempt, notify)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(PeerpodError::DeadlineExceeded(format!(
            "{what} did not succeed within {timeout:?}: {error}"
        ))),
        Err(_) => {
            let error = last_error
                .lock()
                .ok()
                .and_then(|last| last.clone())
                .unwrap_or_else(|| "no attempt finished".into());
            Err(PeerpodError::DeadlineExceeded(format!(
                "{what} did not succeed within {timeout:?}: {error}"
            )))
        }
    }
}

/// Runs `operation` under `policy` at most `attempts` times and returns the last error.
pub async fn retry_times<T, F, Fut>(
    attempts: u32,
    mut policy: ExponentialBackoff,
    mut operation: F,
) -> PeerpodResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PeerpodResult<T>>,
{
    policy.reset();
    let attempts = attempts.max(1);
    let mut made = 0;
    let attempt = || {
        made += 1;
        let last = made >= attempts;
        let attempt = operation();
        async move {
            attempt.await.map_err(|error| {
                if last {
                    BackoffError::permanent(error)
                } else {
                    BackoffError::transient(error)
                }
            })
        }
    };
    let notify = |error: PeerpodError, delay: Duration| {
        debug!(%error, ?delay, "retrying");
    };

    retry_notify(policy, attempt, notify).await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> ExponentialBackoff {
        exponential_policy(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_retry_until_succeeds_after_failures() -> anyhow::Result<()> {
        let calls = &AtomicU32::new(0);
        let value = retry_until("dial", Duration::from_secs(10), fast(), || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(PeerpodError::Unavailable("refused".into())),
                n => Ok(n),
            }
        })
        .await?;
        assert_eq!(value, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_until_gives_up_at_deadline() -> anyhow::Result<()> {
        let started = Instant::now();
        let result = retry_until("dial", Duration::from_millis(50), fast(), || async {
            PeerpodResult::<()>::Err(PeerpodError::Unavailable("refused".into()))
        })
        .await;

        let Err(err) = result else {
            anyhow::bail!("retrying never gave up");
        };
        assert_eq!(err.kind(), crate::ErrorKind::DeadlineExceeded);
        assert!(err.to_string().contains("refused"));
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_until_abandons_hung_attempt() -> anyhow::Result<()> {
        let result = retry_until("dial", Duration::from_millis(50), fast(), || async {
            std::future::pending::<PeerpodResult<()>>().await
        })
        .await;
        assert_eq!(result.err().map(|e| e.kind()), Some(crate::ErrorKind::DeadlineExceeded));
        Ok(())
    }

    #[tokio::test]
    async fn test_fixed_policy_polls_at_interval() -> anyhow::Result<()> {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();
        let result = retry_until(
            "poll",
            Duration::from_millis(250),
            fixed_policy(Duration::from_millis(100)),
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                PeerpodResult::<()>::Err(PeerpodError::NotFound("not yet".into()))
            },
        )
        .await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
        let calls = calls.load(Ordering::SeqCst);
        assert!((2..=4).contains(&calls), "polled {calls} times");
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_times_returns_last_error() {
        let calls = &AtomicU32::new(0);
        let result = retry_times(3, fast(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            PeerpodResult::<()>::Err(PeerpodError::Unavailable("busy".into()))
        })
        .await;
        assert_eq!(result.err().map(|e| e.kind()), Some(crate::ErrorKind::Unavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
