//! Small concurrency helpers shared across components.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Busy-wait mutual exclusion for very short critical sections.
///
/// Intended for read-modify-write windows of a few atomic operations where
/// contention is brief and frequent. Holders must not block or suspend.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self { locked: AtomicBool::new(false) }
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

/// Guard releasing the [`SpinLock`] on drop.
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A `Duration` behind an atomic, stored as nanoseconds.
///
/// Saturates at `u64::MAX` nanoseconds (~584 years), far beyond any process
/// uptime the callers track.
#[derive(Debug, Default)]
pub struct AtomicDuration {
    nanos: AtomicU64,
}

impl AtomicDuration {
    pub const fn zero() -> Self {
        Self { nanos: AtomicU64::new(0) }
    }

    pub fn load(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    pub fn store(&self, d: Duration) {
        self.nanos.store(as_nanos(d), Ordering::Release);
    }

    /// Store `new` only if the current value still equals `current`.
    /// Returns whether the swap happened.
    pub fn compare_and_swap(&self, current: Duration, new: Duration) -> bool {
        self.nanos
            .compare_exchange(
                as_nanos(current),
                as_nanos(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
