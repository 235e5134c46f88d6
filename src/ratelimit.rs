//! Outbound rate limiting.
//!
//! Every rate-limited send first acquires a [`Lease`] from the
//! [`RateLimiter`]. Backpressure is expressed by `acquire` suspending;
//! queue overflow is expressed by a non-acquired lease carrying a reason
//! phrase.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::error::{Error, Result};

/// The outcome of a lease acquisition.
#[derive(Debug)]
pub struct Lease {
    acquired: bool,
    reason: Option<String>,
}

impl Lease {
    /// A granted lease.
    pub fn granted() -> Self {
        Self {
            acquired: true,
            reason: None,
        }
    }

    /// A declined lease with a reason phrase.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            acquired: false,
            reason: Some(reason.into()),
        }
    }

    /// Whether the lease was granted.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// The limiter's reason phrase, if any.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Return the lease to the limiter. The built-in limiters have nothing
    /// to reclaim; custom limiters may override semantics via Drop in
    /// their own lease wrappers.
    pub fn release(self) {}
}

/// Producer-side rate limiting policy for outbound commands.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Acquire a send lease for `command`, suspending while the limiter
    /// applies backpressure. Fails only with [`Error::Cancelled`].
    async fn acquire(&self, command: &Command, cancel: &CancellationToken) -> Result<Lease>;
}

/// A limiter that always grants.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnlimitedRateLimiter;

#[async_trait]
impl RateLimiter for UnlimitedRateLimiter {
    async fn acquire(&self, _command: &Command, _cancel: &CancellationToken) -> Result<Lease> {
        Ok(Lease::granted())
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter: a burst allowance refilled at one token per
/// `refill_interval`.
///
/// Waiters beyond `max_waiters` are declined immediately with a
/// "queue full" lease instead of suspending.
pub struct TokenBucketLimiter {
    burst: u32,
    refill_interval: Duration,
    max_waiters: usize,
    waiters: AtomicUsize,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    /// A limiter allowing `burst` immediate sends, refilling one send per
    /// `refill_interval`.
    pub fn new(burst: u32, refill_interval: Duration, max_waiters: usize) -> Self {
        Self {
            burst: burst.max(1),
            refill_interval,
            max_waiters,
            waiters: AtomicUsize::new(0),
            state: Mutex::new(BucketState {
                tokens: burst.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn try_take(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if !self.refill_interval.is_zero() {
            let refilled = now.duration_since(state.last_refill).as_secs_f64()
                / self.refill_interval.as_secs_f64();
            state.tokens = (state.tokens + refilled).min(self.burst as f64);
        } else {
            state.tokens = self.burst as f64;
        }
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - state.tokens;
            Some(self.refill_interval.mul_f64(missing))
        }
    }
}

impl Default for TokenBucketLimiter {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(2), 32)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self, _command: &Command, cancel: &CancellationToken) -> Result<Lease> {
        let queued = self.waiters.fetch_add(1, Ordering::SeqCst);
        if queued >= self.max_waiters {
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            return Ok(Lease::rejected("rate limit queue full"));
        }

        let result = loop {
            match self.try_take() {
                None => break Ok(Lease::granted()),
                Some(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break Err(Error::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        };
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOptions;

    fn ping() -> Command {
        Command::client("PING")
            .arg("x")
            .build(&CommandOptions::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_burst_grants_immediately() {
        let limiter = TokenBucketLimiter::new(3, Duration::from_secs(60), 8);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let lease = limiter.acquire(&ping(), &cancel).await.unwrap();
            assert!(lease.is_acquired());
            lease.release();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspends_until_refill() {
        let limiter = TokenBucketLimiter::new(1, Duration::from_secs(2), 8);
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(&ping(), &cancel).await.unwrap().is_acquired());

        let started = Instant::now();
        assert!(limiter.acquire(&ping(), &cancel).await.unwrap().is_acquired());
        assert!(started.elapsed() >= Duration::from_millis(1900));
    }

    #[tokio::test]
    async fn test_queue_full_rejects() {
        let limiter = TokenBucketLimiter::new(1, Duration::from_secs(3600), 0);
        let cancel = CancellationToken::new();
        let lease = limiter.acquire(&ping(), &cancel).await.unwrap();
        assert!(!lease.is_acquired());
        assert_eq!(lease.reason(), Some("rate limit queue full"));
    }

    #[tokio::test]
    async fn test_cancel_observed() {
        let limiter = TokenBucketLimiter::new(1, Duration::from_secs(3600), 8);
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(&ping(), &cancel).await.unwrap().is_acquired());

        cancel.cancel();
        let err = limiter.acquire(&ping(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_unlimited() {
        let limiter = UnlimitedRateLimiter;
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(&ping(), &cancel).await.unwrap().is_acquired());
    }
}
