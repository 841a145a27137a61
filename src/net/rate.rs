//! Flood rate limiting.
//!
//! A per-peer token bucket fed by the session's tick input. When the
//! bucket runs dry the session coalesces deltas instead of sending, so
//! a churn storm degrades into fewer, larger floods rather than a queue.

use crate::core::time::Tick;

/// Token bucket with fractional accumulation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Tick,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(refill_per_sec: u32, capacity: u32, now: Tick) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Tick) {
        let elapsed_ms = now.since(self.last_refill);
        if elapsed_ms == 0 {
            return;
        }
        self.tokens =
            (self.tokens + self.refill_per_sec * (elapsed_ms as f64) / 1_000.0).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: Tick) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refill).
    pub fn available(&mut self, now: Tick) -> u32 {
        self.refill(now);
        self.tokens as u32
    }

    /// Earliest tick at which one token will be available.
    pub fn next_token_at(&mut self, now: Tick) -> Tick {
        self.refill(now);
        if self.tokens >= 1.0 {
            return now;
        }
        let deficit = 1.0 - self.tokens;
        let wait_ms = (deficit * 1_000.0 / self.refill_per_sec).ceil() as u64;
        now.add_ms(wait_ms)
    }
}
