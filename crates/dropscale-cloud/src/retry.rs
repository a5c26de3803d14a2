//! Bounded retry with jittered scheduling.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a failed attempt should be treated by [`retry`].
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    /// Worth trying again after the interval.
    #[error(transparent)]
    Transient(E),
    /// Terminate the retry loop immediately with this cause.
    #[error(transparent)]
    Fatal(E),
}

/// Terminal outcome of an exhausted or aborted retry loop.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every allowed attempt failed.
    #[error("reached retry limit")]
    LimitReached(#[source] E),

    /// An attempt reported a non-retryable error.
    #[error("aborted: {0}")]
    Fatal(#[source] E),

    /// The caller's cancellation token fired between attempts.
    #[error("cancelled while retrying")]
    Cancelled { last: Option<E> },
}

/// Retry `f` until it succeeds, fails fatally, exhausts `max_attempts`
/// or `cancel` fires.
///
/// The wait between attempts is `interval + jitter/5 - interval/10`
/// with `jitter` drawn once per call from `[0, interval)`, spreading
/// simultaneous callers by roughly ±10% without reordering any single
/// caller's schedule.
pub async fn retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    max_attempts: u32,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError<E>>>,
{
    if cancel.is_cancelled() {
        return Err(RetryError::Cancelled { last: None });
    }

    let jitter = interval.mul_f64(rand::random::<f64>());
    let wait = interval + jitter / 5 - interval / 10;

    let mut last: Option<E> = None;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(AttemptError::Fatal(err)) => return Err(RetryError::Fatal(err)),
            Err(AttemptError::Transient(err)) => {
                debug!(attempt, error = %err, "retry attempt failed");
                if attempt >= max_attempts {
                    return Err(RetryError::LimitReached(err));
                }
                last = Some(err);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { last: last.take() }),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Retry `f` only while it fails with a known-transient provider error.
///
/// The provider's own client handles rate limiting, but HTTP 422 shows
/// up when e.g. several reserved addresses are assigned concurrently;
/// those settle within the 10 s x 30 budget. Any other error terminates
/// the loop at once.
pub async fn retry_on_transient<T, F, Fut>(
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, RetryError<crate::CloudError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::CloudResult<T>>,
{
    retry(cancel, Duration::from_secs(10), 30, || {
        let fut = f();
        async move {
            fut.await.map_err(|err| {
                if err.is_transient() {
                    AttemptError::Transient(err)
                } else {
                    AttemptError::Fatal(err)
                }
            })
        }
    })
    .await
}
