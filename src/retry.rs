//! Bounded exponential backoff with jitter, cancellation-aware.

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::options::RetryOptions;

/// Outcome of a retry loop: either the operation's own result, or an
/// indication that the loop was cancelled before the operation could
/// complete.
pub enum Outcome<T> {
    Completed(Result<T, Error>),
    Cancelled,
}

/// Run `op` up to `opts.max_attempts` times, backing off between
/// attempts according to `opts`. `op` is re-invoked from scratch on
/// each attempt -- callers are responsible for making it safe to retry
/// (e.g. re-opening a source reader from the start).
///
/// Retry stops early when `cancellation` is triggered, or when an
/// error's [`Error::is_retryable`] returns false.
pub async fn retry<T, F, Fut>(
    opts: &RetryOptions,
    cancellation: &CancellationToken,
    mut op: F,
) -> Outcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if cancellation.is_cancelled() {
            return Outcome::Cancelled;
        }

        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Outcome::Cancelled,
            result = op(attempt) => result,
        };

        match result {
            Ok(value) => return Outcome::Completed(Ok(value)),
            Err(err) => {
                let exhausted = attempt >= opts.max_attempts;
                if exhausted {
                    warn!(
                        attempt,
                        max_attempts = opts.max_attempts,
                        kind = %err.kind(),
                        "giving up after retry"
                    );
                    return Outcome::Completed(Err(err.exhausted(attempt)));
                }
                if !err.is_retryable() {
                    warn!(attempt, kind = %err.kind(), "giving up on non-retryable error");
                    return Outcome::Completed(Err(err));
                }

                let delay = backoff_delay(opts, attempt);
                debug!(attempt, ?delay, kind = %err.kind(), "retrying after backoff");

                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Outcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn backoff_delay(opts: &RetryOptions, attempt: u32) -> std::time::Duration {
    let exp = opts.multiplier.powi(attempt.saturating_sub(1) as i32);
    let base_ms = opts.base_delay.as_millis() as f64 * exp;
    let jitter_ms = if opts.jitter > 0.0 {
        rand::thread_rng().gen_range(0.0..=(base_ms * opts.jitter))
    } else {
        0.0
    };
    let total_ms = (base_ms + jitter_ms).min(opts.max_delay.as_millis() as f64);
    std::time::Duration::from_millis(total_ms.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let opts = RetryOptions::default();
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let outcome = retry(&opts, &token, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(42) }
        })
        .await;
        assert!(matches!(outcome, Outcome::Completed(Ok(42))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let mut opts = RetryOptions::default();
        opts.base_delay = std::time::Duration::from_millis(1);
        opts.max_delay = std::time::Duration::from_millis(5);
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let outcome = retry(&opts, &token, |attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(Error::new(ErrorKind::Timeout, "op", "x"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert!(matches!(outcome, Outcome::Completed(Ok(3))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_gives_up_immediately() {
        let opts = RetryOptions::default();
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let outcome: Outcome<()> = retry(&opts, &token, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::not_found("op", "x").retryable(false)) }
        })
        .await;
        assert!(matches!(outcome, Outcome::Completed(Err(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_wraps_the_last_error() {
        let mut opts = RetryOptions::default();
        opts.max_attempts = 2;
        opts.base_delay = std::time::Duration::from_millis(1);
        opts.max_delay = std::time::Duration::from_millis(5);
        let token = CancellationToken::new();
        let outcome: Outcome<()> = retry(&opts, &token, |_attempt| async {
            Err(Error::new(ErrorKind::Timeout, "op", "x"))
        })
        .await;
        match outcome {
            Outcome::Completed(Err(err)) => {
                assert!(err.is(ErrorKind::Timeout));
                assert!(err.to_string().contains("attempts exhausted"));
            }
            _ => panic!("expected exhausted error"),
        }
    }

    #[tokio::test]
    async fn cancellation_short_circuits_loop() {
        let opts = RetryOptions::default();
        let token = CancellationToken::new();
        token.cancel();
        let outcome: Outcome<()> = retry(&opts, &token, |_attempt| async {
            Err(Error::new(ErrorKind::Timeout, "op", "x"))
        })
        .await;
        assert!(matches!(outcome, Outcome::Cancelled));
    }
}
