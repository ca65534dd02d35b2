//! Airtime budget enforcement.
//!
//! A token bucket shared across all per-node update tasks. Every
//! request-bearing radio operation spends one token; when the bucket is
//! empty the operation is skipped and retried on a later cycle rather than
//! queued, keeping a crowded mesh from being hammered by the monitor.
//!
//! Refill is lazy and whole-token: tokens are only added in integer steps,
//! and the refill timestamp advances by exactly the time those tokens
//! represent, so fractional progress toward the next token is never lost.

use std::time::Instant;

use log::debug;

pub const DEFAULT_CAPACITY: f64 = 20.0;
/// One token every two minutes.
pub const DEFAULT_SECONDS_PER_TOKEN: f64 = 120.0;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    seconds_per_token: f64,
    /// Monotonic timestamp of the last whole-token refill, in seconds since
    /// `origin`.
    last_refill: f64,
    origin: Instant,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn new(capacity: f64, seconds_per_token: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            seconds_per_token,
            last_refill: 0.0,
            origin: Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Add whole tokens earned since the last refill. `last_refill` only
    /// advances by the time those whole tokens represent.
    fn refill_at(&mut self, now: f64) {
        let elapsed = now - self.last_refill;
        if elapsed <= 0.0 {
            return;
        }
        let whole = (elapsed / self.seconds_per_token).floor();
        if whole >= 1.0 {
            self.tokens = (self.tokens + whole).min(self.capacity);
            self.last_refill += whole * self.seconds_per_token;
        }
    }

    /// Take one token if available. Never blocks.
    pub fn try_consume(&mut self) -> bool {
        let now = self.now();
        self.try_consume_at(now)
    }

    /// Clock-explicit variant of [`try_consume`](Self::try_consume).
    pub fn try_consume_at(&mut self, now: f64) -> bool {
        self.refill_at(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            debug!("token bucket empty ({:.2} tokens)", self.tokens);
            false
        }
    }

    /// Seconds until the next token becomes available, zero if one is
    /// available now.
    pub fn wait_time(&mut self) -> f64 {
        let now = self.now();
        self.wait_time_at(now)
    }

    pub fn wait_time_at(&mut self, now: f64) -> f64 {
        self.refill_at(now);
        if self.tokens >= 1.0 {
            0.0
        } else {
            let next_at = self.last_refill + self.seconds_per_token;
            (next_at - now).max(0.0)
        }
    }

    /// Current token balance after a refill check.
    pub fn available(&mut self) -> f64 {
        let now = self.now();
        self.available_at(now)
    }

    pub fn available_at(&mut self, now: f64) -> f64 {
        self.refill_at(now);
        self.tokens
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_SECONDS_PER_TOKEN)
    }
}
