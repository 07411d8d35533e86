//! Clock abstractions used by the windowed and time-decayed components.

use std::time::{Duration, Instant};

/// Thread-safe monotonic time source.
///
/// Readings are durations since the implementer's origin. Clones must share
/// the origin so their readings stay directly comparable, and readings must
/// be immune to wall-clock jumps. Calls must be safe concurrently
/// (`Send + Sync`).
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Elapsed time since this clock's origin.
    fn now(&self) -> Duration;
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Clones share the same origin (instant captured at creation). Independently
/// created instances have different origins and their readings are not
/// directly comparable. Resets on process restart.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    /// Create a new monotonic clock starting at `Instant::now()`.
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}
