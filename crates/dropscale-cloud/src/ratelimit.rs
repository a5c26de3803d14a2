//! Token-bucket rate limiter with periodic recharge.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Returned when the caller's token fires before a rate-limiter token
/// became available; nothing is consumed in that case.
#[derive(Debug, Error)]
#[error("cancelled while waiting for a rate limiter token")]
pub struct RateLimitCancelled;

struct State {
    current: u32,
    next_check: Instant,
}

/// A token bucket of `burst` capacity recharging one token per period.
///
/// The provider allows a fixed number of reserved-address creations per
/// minute on top of its general rate limits; callers consume one token
/// per creation and block until one is available.
pub struct RateLimiter {
    burst: u32,
    recharge: Duration,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(burst: u32, recharge: Duration, start_full: bool) -> Self {
        Self {
            burst,
            recharge,
            state: Mutex::new(State {
                current: if start_full { burst } else { 0 },
                next_check: Instant::now() + recharge,
            }),
        }
    }

    /// Take one token, waiting for the next recharge if none is banked.
    ///
    /// The internal lock is held across the wait so concurrent callers
    /// consume strictly one token per recharge period. If `cancel`
    /// fires during the wait the pending token is left for the next
    /// caller.
    pub async fn consume(&self, cancel: &CancellationToken) -> Result<(), RateLimitCancelled> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        // Bank every whole recharge period that has elapsed.
        loop {
            if state.current == self.burst {
                state.next_check = now + self.recharge;
                break;
            }
            if state.next_check > now {
                break;
            }
            state.current += 1;
            state.next_check += self.recharge;
        }

        if state.current > 0 {
            state.current -= 1;
            return Ok(());
        }

        let deadline = state.next_check;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                state.next_check += self.recharge;
                Ok(())
            }
            _ = cancel.cancelled() => Err(RateLimitCancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    async fn elapsed<F: Future>(fut: F) -> (F::Output, Duration) {
        let start = Instant::now();
        let out = fut.await;
        (out, start.elapsed())
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_blocks_for_recharge() {
        let limiter = RateLimiter::new(2, Duration::from_secs(5), true);
        let cancel = CancellationToken::new();

        // Two banked tokens are immediate.
        let (_, wait) = elapsed(limiter.consume(&cancel)).await;
        assert_eq!(wait, Duration::ZERO);
        let (_, wait) = elapsed(limiter.consume(&cancel)).await;
        assert_eq!(wait, Duration::ZERO);

        // Third call waits out the full recharge period.
        let (result, wait) = elapsed(limiter.consume(&cancel)).await;
        assert!(result.is_ok());
        assert_eq!(wait, Duration::from_secs(5));

        // 8s later one token has been banked...
        tokio::time::advance(Duration::from_secs(8)).await;
        let (_, wait) = elapsed(limiter.consume(&cancel)).await;
        assert_eq!(wait, Duration::ZERO);

        // ...and the next token is 2s out.
        let (result, wait) = elapsed(limiter.consume(&cancel)).await;
        assert!(result.is_ok());
        assert_eq!(wait, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn starts_empty_when_not_full() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1), false);
        let cancel = CancellationToken::new();

        let (result, wait) = elapsed(limiter.consume(&cancel)).await;
        assert!(result.is_ok());
        assert_eq!(wait, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn banked_tokens_cap_at_burst() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1), true);
        let cancel = CancellationToken::new();

        // A long idle period must not bank more than `burst` tokens.
        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..2 {
            let (_, wait) = elapsed(limiter.consume(&cancel)).await;
            assert_eq!(wait, Duration::ZERO);
        }
        let (_, wait) = elapsed(limiter.consume(&cancel)).await;
        assert_eq!(wait, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_does_not_consume() {
        let limiter = RateLimiter::new(1, Duration::from_secs(5), true);
        let cancel = CancellationToken::new();

        limiter.consume(&cancel).await.unwrap();

        // Cancel mid-wait: the pending token must not be consumed.
        let cancelled = CancellationToken::new();
        let waiter = {
            let child = cancelled.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                child.cancel();
            });
            limiter.consume(&cancelled).await
        };
        assert!(waiter.is_err());

        // The token that recharges is still available to the next call.
        let (result, wait) = elapsed(limiter.consume(&cancel)).await;
        assert!(result.is_ok());
        assert!(wait <= Duration::from_secs(4));
    }
}
