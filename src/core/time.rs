//! Time utilities.
//!
//! Stores consume time as monotonic [`Tick`] values fed in by their event
//! loop rather than sampling the wall clock inside merge or expiry paths.
//! This keeps TTL arithmetic deterministic and lets tests drive expiry
//! without sleeping.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A point in monotonic store time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick {
    /// Milliseconds since the clock's epoch.
    pub ms: u64,
}

impl Tick {
    /// Create a tick with the given millisecond value.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// The zero tick (clock epoch).
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Add milliseconds to this tick.
    pub const fn add_ms(self, ms: u64) -> Self {
        Self { ms: self.ms + ms }
    }

    /// Milliseconds elapsed since an earlier tick (0 if `earlier` is later).
    pub fn since(self, earlier: Tick) -> u64 {
        self.ms.saturating_sub(earlier.ms)
    }

    /// Check if this tick is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Tick) -> bool {
        self.ms >= deadline.ms
    }

    /// Milliseconds until a deadline (0 if already passed).
    pub fn ms_until(self, deadline: Tick) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.ms)
    }
}

/// Source of ticks for a store event loop.
pub trait Clock: Send + Sync {
    /// Current tick.
    fn now(&self) -> Tick;
}

/// Monotonic wall-clock source, anchored at construction.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    /// Create a clock anchored at the current instant.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Tick {
        Tick::new(self.start.elapsed().as_millis() as u64)
    }
}

/// Manually advanced clock for deterministic tests.
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at the given tick.
    pub fn new(start: Tick) -> Self {
        Self {
            now_ms: AtomicU64::new(start.ms),
        }
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the clock to an absolute tick.
    pub fn set(&self, tick: Tick) {
        self.now_ms.store(tick.ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        Tick::new(self.now_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_arithmetic() {
        let t = Tick::new(100);
        assert_eq!(t.add_ms(50), Tick::new(150));
        assert_eq!(Tick::new(150).since(t), 50);
        assert_eq!(t.since(Tick::new(150)), 0);
        assert_eq!(t.ms_until(Tick::new(175)), 75);
        assert_eq!(Tick::new(200).ms_until(t), 0);
        assert!(Tick::new(100).is_at_or_after(Tick::new(100)));
        assert!(!Tick::new(99).is_at_or_after(Tick::new(100)));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Tick::zero());
        assert_eq!(clock.now(), Tick::zero());
        clock.advance(250);
        assert_eq!(clock.now(), Tick::new(250));
        clock.set(Tick::new(1_000));
        assert_eq!(clock.now(), Tick::new(1_000));
    }
}
