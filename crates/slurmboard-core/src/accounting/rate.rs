//! Token-bucket rate limiting for accounting tool calls.
//!
//! The accounting database is shared site-wide; each cluster's poller is
//! allowed a fixed number of calls per minute, refilled continuously.

use std::time::{Duration, Instant};

/// A continuously refilled token bucket. `acquire` blocks the calling thread
/// until a token is available; the poller is single-threaded so blocking here
/// is the intended suspension point.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket allowing `calls_per_minute` calls per minute. The bucket starts
    /// full so a fresh poller can issue its first call immediately.
    pub fn per_minute(calls_per_minute: u32) -> Self {
        let capacity = f64::from(calls_per_minute.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one token is available; zero if one is available now.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }

    /// Takes one token, sleeping until the bucket allows it.
    pub fn acquire(&mut self) {
        let wait = self.wait_time(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        self.refill(Instant::now());
        // after the sleep at least one token has accrued
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_drains() {
        let mut bucket = TokenBucket::per_minute(2);
        let now = Instant::now();
        assert_eq!(bucket.wait_time(now), Duration::ZERO);
        bucket.tokens -= 1.0;
        assert_eq!(bucket.wait_time(now), Duration::ZERO);
        bucket.tokens -= 1.0;
        let wait = bucket.wait_time(now);
        // 2/min refills one token in ~30s
        assert!(wait > Duration::from_secs(25) && wait <= Duration::from_secs(30));
    }

    #[test]
    fn refills_continuously() {
        let mut bucket = TokenBucket::per_minute(60);
        let start = Instant::now();
        bucket.tokens = 0.0;
        bucket.last_refill = start;
        // one call per second: after two simulated seconds, a token is ready
        let wait = bucket.wait_time(start + Duration::from_secs(2));
        assert_eq!(wait, Duration::ZERO);
        assert!(bucket.tokens >= 1.0);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut bucket = TokenBucket::per_minute(2);
        let start = Instant::now();
        bucket.last_refill = start;
        bucket.refill(start + Duration::from_secs(3600));
        assert!(bucket.tokens <= 2.0);
    }
}
