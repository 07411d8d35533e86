//! Time-bucketed rolling window, the statistics substrate of the breaker and
//! the shedder.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};

/// Accumulator for one time slot: the sum of added values and the number of
/// additions that landed in the slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bucket {
    pub sum: f64,
    pub count: u64,
}

impl Bucket {
    fn add(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

struct Ring {
    buckets: Vec<Bucket>,
    offset: usize,
    // start time of the bucket currently being written
    last_time: Duration,
}

/// A ring of `size` buckets cycling through wall time with equal `interval`.
///
/// Expired buckets are reset lazily on the next operation rather than by a
/// background task, so all costs stay on the caller's path. A single
/// reader-writer lock protects the ring: [`add`](RollingWindow::add) takes
/// the write lock, [`reduce`](RollingWindow::reduce) the read lock.
/// Callbacks passed to `reduce` must not re-enter the window.
pub struct RollingWindow {
    inner: RwLock<Ring>,
    size: usize,
    interval: Duration,
    // skip the bucket currently being written when reducing; its interval may
    // be partial
    ignore_current: bool,
    clock: Arc<dyn Clock>,
}

impl RollingWindow {
    /// Create a window of `size` buckets with the given per-bucket interval.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize, interval: Duration) -> Self {
        Self::with_clock(size, interval, Arc::new(MonotonicClock::new()))
    }

    /// Like [`new`](Self::new), but reading time from the given clock.
    pub fn with_clock(size: usize, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        assert!(size >= 1, "size must be greater than 0");
        let last_time = clock.now();
        Self {
            inner: RwLock::new(Ring {
                buckets: vec![Bucket::default(); size],
                offset: 0,
                last_time,
            }),
            size,
            interval,
            ignore_current: false,
            clock,
        }
    }

    /// Make [`reduce`](Self::reduce) skip the bucket currently being written.
    pub fn ignore_current_bucket(mut self) -> Self {
        self.ignore_current = true;
        self
    }

    /// Accumulate `v` into the bucket corresponding to now.
    pub fn add(&self, v: f64) {
        let mut ring = self.inner.write().unwrap();
        let now = self.clock.now();
        self.slide(&mut ring, now);
        let offset = ring.offset;
        ring.buckets[offset].add(v);
    }

    /// Invoke `f` on each non-expired bucket in logical time order.
    pub fn reduce<F>(&self, mut f: F)
    where
        F: FnMut(&Bucket),
    {
        let ring = self.inner.read().unwrap();
        let now = self.clock.now();
        let span = self.span(&ring, now);
        let diff = if span == 0 && self.ignore_current {
            self.size - 1
        } else {
            self.size - span
        };
        if diff > 0 {
            // buckets between the offset and offset+span are expired and must
            // not be counted
            let start = (ring.offset + span + 1) % self.size;
            for i in 0..diff {
                f(&ring.buckets[(start + i) % self.size]);
            }
        }
    }

    // How many whole intervals elapsed since the last write, clamped to the
    // ring size so long idle periods do not loop through needless resets.
    fn span(&self, ring: &Ring, now: Duration) -> usize {
        let elapsed = now.saturating_sub(ring.last_time);
        let spans = (elapsed.as_nanos() / self.interval.as_nanos()) as usize;
        spans.min(self.size)
    }

    fn slide(&self, ring: &mut Ring, now: Duration) {
        let span = self.span(ring, now);
        if span == 0 {
            return;
        }
        let offset = ring.offset;
        for i in 0..span {
            let idx = (offset + i + 1) % self.size;
            ring.buckets[idx].reset();
        }
        ring.offset = (offset + span) % self.size;
        // align to the interval grid so drift does not accumulate
        let since = now.saturating_sub(ring.last_time);
        let rem = since.as_nanos() % self.interval.as_nanos();
        ring.last_time = now - Duration::from_nanos(rem as u64);
    }
}
