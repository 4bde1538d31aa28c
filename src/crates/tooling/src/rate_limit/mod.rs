//! Rate limiting utilities
//!
//! Provides a token bucket rate limiter for controlling event frequency.

use std::time::{Duration, Instant};

use tracing::trace;

/// Token bucket rate limiter with reservation semantics.
///
/// Tokens refill at `rate` per second up to a bucket capacity of `burst`.
/// Unlike a blocking acquire, [`RateLimiter::reserve`] always takes the
/// token immediately and reports how long the caller must wait before the
/// reservation is honored. The bucket may go negative; that debt is what
/// produces the wait. This shape lets an event loop keep servicing its
/// other channels while it sits out the delay.
///
/// A `rate` of `f64::INFINITY` disables limiting entirely.
///
/// # Example
///
/// ```rust
/// use converge_tooling::rate_limit::RateLimiter;
/// use std::time::Duration;
///
/// // 5 events/sec, bucket of 2
/// let mut limiter = RateLimiter::new(5.0, 2);
///
/// // The burst is free...
/// assert_eq!(limiter.reserve(), Duration::ZERO);
/// assert_eq!(limiter.reserve(), Duration::ZERO);
/// // ...the next token costs a wait.
/// assert!(limiter.reserve() > Duration::ZERO);
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens per second; `f64::INFINITY` means unlimited.
    rate: f64,

    /// Maximum number of stored tokens.
    burst: usize,

    /// Current token balance; negative when reservations outpace refill.
    tokens: f64,

    /// Last refill time.
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a new rate limiter. The bucket starts full.
    pub fn new(rate: f64, burst: usize) -> Self {
        Self {
            rate,
            burst,
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    /// Whether this limiter admits everything.
    pub fn is_unlimited(&self) -> bool {
        self.rate.is_infinite()
    }

    /// Take one token and return the wait before the reservation is valid.
    ///
    /// Returns [`Duration::ZERO`] when a token was available immediately.
    pub fn reserve(&mut self) -> Duration {
        self.reserve_at(Instant::now())
    }

    /// [`Self::reserve`] against an explicit clock, for tests.
    pub fn reserve_at(&mut self, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            return Duration::ZERO;
        }
        if self.rate <= 0.0 {
            // nothing ever refills: the debt can never be repaid
            return Duration::MAX;
        }
        let wait = Duration::try_from_secs_f64(-self.tokens / self.rate).unwrap_or(Duration::MAX);
        trace!(wait_ms = wait.as_millis() as u64, "rate limited");
        wait
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let refilled = self.tokens + elapsed.as_secs_f64() * self.rate;
        self.tokens = refilled.min(self.burst as f64);
    }
}
