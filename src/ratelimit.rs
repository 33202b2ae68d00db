//! Token-bucket rate limiter for the background traffic generator.
//!
//! Tokens are bytes. The bucket refills continuously at the target rate and
//! caps at `rate × burst_factor`, so short bursts up to a quarter-second's
//! worth of traffic are admitted while the long-run average converges on the
//! target. `try_consume` never blocks; the caller sleeps for
//! [`TokenBucket::backoff_for`] on rejection.

use std::time::{Duration, Instant};

/// Headroom above one second's worth of tokens.
pub const DEFAULT_BURST_FACTOR: f64 = 1.25;

#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    rate: f64,
    capacity: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket admitting `rate` bytes per second.
    ///
    /// Starts empty so the first second of a run does not overshoot the
    /// target; bursts up to the capacity accumulate during idle periods.
    pub fn new(rate: f64) -> Self {
        Self::new_at(rate, Instant::now())
    }

    pub fn with_burst(rate: f64, burst_factor: f64) -> Self {
        Self::with_burst_at(rate, burst_factor, Instant::now())
    }

    fn new_at(rate: f64, now: Instant) -> Self {
        Self::with_burst_at(rate, DEFAULT_BURST_FACTOR, now)
    }

    fn with_burst_at(rate: f64, burst_factor: f64, now: Instant) -> Self {
        let rate = rate.max(0.0);
        let capacity = rate * burst_factor.max(1.0);
        Self {
            tokens: 0.0,
            rate,
            capacity,
            last_refill: now,
        }
    }

    /// Spend `n` tokens if available. Never blocks, never goes negative.
    pub fn try_consume(&mut self, n: usize) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    /// Change the target rate, keeping accumulated tokens (clamped to the
    /// new capacity).
    pub fn adjust_rate(&mut self, rate: f64) {
        self.adjust_rate_at(rate, Instant::now());
    }

    /// How long until `n` tokens will have accumulated from empty.
    ///
    /// The caller sleeps this long after a rejection instead of spinning.
    pub fn backoff_for(&self, n: usize) -> Duration {
        if self.rate <= 0.0 {
            return Duration::from_millis(100);
        }
        Duration::from_secs_f64(n as f64 / self.rate)
    }

    /// Configured rate in bytes per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Tokens currently available (after refilling to `now`).
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }

    fn try_consume_at(&mut self, n: usize, now: Instant) -> bool {
        self.refill(now);
        let cost = n as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    fn adjust_rate_at(&mut self, rate: f64, now: Instant) {
        self.refill(now);
        self.rate = rate.max(0.0);
        self.capacity = self.rate * DEFAULT_BURST_FACTOR;
        self.tokens = self.tokens.min(self.capacity);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}
