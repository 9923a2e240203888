//! Retry logic.
//!
//! Runs an operation until it succeeds or the backoff policy gives up,
//! reporting every failure together with the delay before the next attempt.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::resilience::backoff::ExponentialBackoff;

/// Retry `operation` according to `backoff`.
///
/// `notify` sees each error that will be retried. When the policy gives up,
/// the last error is returned. Dropping the returned future cancels the
/// retry, including a pending sleep.
pub async fn retry_notify<T, E, Op, Fut, N>(
    mut backoff: ExponentialBackoff,
    mut operation: Op,
    mut notify: N,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    N: FnMut(&E, Duration),
{
    backoff.reset();
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match backoff.next_backoff() {
            Some(delay) => {
                notify(&err, delay);
                tokio::time::sleep(delay).await;
            }
            None => return Err(err),
        }
    }
}

/// Retry a long-running `operation` according to `backoff`.
///
/// Same as [`retry_notify`], except that an attempt which ran for at least
/// `healthy_after` before failing restarts the backoff sequence. Isolated
/// failures far apart are then always retried after the initial interval.
pub async fn retry_notify_with_reset<T, E, Op, Fut, N>(
    mut backoff: ExponentialBackoff,
    healthy_after: Duration,
    mut operation: Op,
    mut notify: N,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    N: FnMut(&E, Duration),
{
    backoff.reset();
    loop {
        let started = Instant::now();
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if started.elapsed() >= healthy_after {
            backoff.reset();
        }

        match backoff.next_backoff() {
            Some(delay) => {
                notify(&err, delay);
                tokio::time::sleep(delay).await;
            }
            None => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(10))
            .with_randomization_factor(0.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let mut notified = Vec::new();

        let result: Result<u32, String> = retry_notify(
            quick(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 { Err(format!("attempt {}", n)) } else { Ok(n) }
                }
            },
            |err, delay| notified.push((err.clone(), delay)),
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(notified.len(), 2);
        assert_eq!(notified[0], ("attempt 0".to_string(), Duration::from_millis(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let backoff = quick().with_max_elapsed_time(Some(Duration::from_millis(25)));

        let result: Result<(), u32> = retry_notify(
            backoff,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(n) }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(result, Err(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_attempt_resets_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0);
        let calls = AtomicU32::new(0);
        let mut delays = Vec::new();

        let result: Result<(), ()> = retry_notify_with_reset(
            backoff,
            Duration::from_secs(10),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        // Short-lived failures grow the delay.
                        0..=2 => Err(()),
                        // Long healthy runs that end in a failure.
                        3..=5 => {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            Err(())
                        }
                        _ => Ok(()),
                    }
                }
            },
            |_, delay| delays.push(delay),
        )
        .await;

        assert_eq!(result, Ok(()));
        let ms: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
        assert_eq!(ms, vec![100, 200, 400, 100, 100, 100]);
    }
}
