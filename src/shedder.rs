//! Adaptive load shedding driven by CPU pressure and observed concurrency.
//!
//! A request is dropped only when both gates fire: the system is overloaded
//! (CPU above threshold, or still inside the cool-off window after an
//! earlier drop) and the in-flight count exceeds what the recent best
//! behavior says the process can sustain (Little's law: peak QPS times
//! minimum response time).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::cpu::CpuProbe;
use crate::sync::{AtomicDuration, SpinLock};
use crate::window::RollingWindow;

const DEFAULT_BUCKETS: usize = 50;
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
// using 1000m notation; 900m is about 90% occupancy
const DEFAULT_CPU_THRESHOLD: i64 = 900;
const DEFAULT_MIN_RT_MILLIS: f64 = 1000.0;
// moving average hyperparameter beta for requests on the fly
const FLYING_BETA: f64 = 0.9;
const COOL_OFF: Duration = Duration::from_secs(1);

/// Returned when the shedder refuses a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("service overloaded")]
pub struct ServiceOverloaded;

struct AdaptiveShedder {
    cpu_threshold: i64,
    // buckets per second
    windows: u64,
    flying: AtomicI64,
    // f64 bits; the spin lock serializes the read-modify-write on completion
    avg_flying: AtomicU64,
    avg_flying_lock: SpinLock,
    drop_time: AtomicDuration,
    dropped_recently: AtomicBool,
    pass_counter: RollingWindow,
    rt_counter: RollingWindow,
    probe: Arc<dyn CpuProbe>,
    clock: Arc<dyn Clock>,
}

/// Cheap cloneable handle to a shedder; clones share all state.
///
/// [`Shedder::nop`] builds a handle that admits everything, so call sites
/// can keep one code path whether shedding is enabled or not.
#[derive(Clone)]
pub struct Shedder {
    inner: Option<Arc<AdaptiveShedder>>,
}

/// Configures and builds a [`Shedder`].
pub struct ShedderBuilder {
    window: Duration,
    buckets: usize,
    cpu_threshold: i64,
    probe: Arc<dyn CpuProbe>,
    clock: Arc<dyn Clock>,
}

impl ShedderBuilder {
    /// Start from the default 5 s / 50-bucket window and 900‰ CPU threshold.
    pub fn new(probe: Arc<dyn CpuProbe>) -> Self {
        Self {
            window: DEFAULT_WINDOW,
            buckets: DEFAULT_BUCKETS,
            cpu_threshold: DEFAULT_CPU_THRESHOLD,
            probe,
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    /// Total statistics window covered by the buckets.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Number of buckets the window is split into.
    pub fn buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets;
        self
    }

    /// CPU threshold in permille above which the system counts as overloaded.
    pub fn cpu_threshold(mut self, permille: i64) -> Self {
        self.cpu_threshold = permille;
        self
    }

    /// Read time from the given clock (useful for deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Shedder {
        let bucket_duration = self.window / self.buckets as u32;
        // both windows skip the bucket being written: a partial interval
        // would skew max-pass and min-rt
        let pass_counter =
            RollingWindow::with_clock(self.buckets, bucket_duration, self.clock.clone())
                .ignore_current_bucket();
        let rt_counter =
            RollingWindow::with_clock(self.buckets, bucket_duration, self.clock.clone())
                .ignore_current_bucket();
        Shedder {
            inner: Some(Arc::new(AdaptiveShedder {
                cpu_threshold: self.cpu_threshold,
                windows: (Duration::from_secs(1).as_nanos() / bucket_duration.as_nanos()) as u64,
                flying: AtomicI64::new(0),
                avg_flying: AtomicU64::new(0f64.to_bits()),
                avg_flying_lock: SpinLock::new(),
                drop_time: AtomicDuration::zero(),
                dropped_recently: AtomicBool::new(false),
                pass_counter,
                rt_counter,
                probe: self.probe,
                clock: self.clock,
            })),
        }
    }
}

impl Shedder {
    /// Builder with the given CPU probe.
    pub fn builder(probe: Arc<dyn CpuProbe>) -> ShedderBuilder {
        ShedderBuilder::new(probe)
    }

    /// A shedder that admits every request.
    pub fn nop() -> Self {
        Self { inner: None }
    }

    /// Check admission. On success the in-flight count is incremented and the
    /// returned [`Promise`] must be resolved with the request outcome.
    pub fn allow(&self) -> Result<Promise, ServiceOverloaded> {
        let Some(shedder) = &self.inner else {
            return Ok(Promise { inner: None, start: Duration::ZERO });
        };
        if shedder.should_drop() {
            shedder.drop_time.store(shedder.clock.now());
            shedder.dropped_recently.store(true, Ordering::Release);
            return Err(ServiceOverloaded);
        }
        shedder.add_flying(1);
        Ok(Promise { start: shedder.clock.now(), inner: Some(shedder.clone()) })
    }

    /// Current in-flight count (0 for a nop shedder).
    pub fn flying(&self) -> i64 {
        self.inner.as_ref().map_or(0, |s| s.flying.load(Ordering::Acquire))
    }
}

impl AdaptiveShedder {
    fn add_flying(&self, delta: i64) {
        let flying = self.flying.fetch_add(delta, Ordering::AcqRel) + delta;
        // update the average only when a request finishes: the average lags
        // the live count, rising slowly under bursts (admit more) and falling
        // slowly after a drop (shed a little longer)
        if delta < 0 {
            let _guard = self.avg_flying_lock.lock();
            let avg = f64::from_bits(self.avg_flying.load(Ordering::Relaxed));
            let next = avg * FLYING_BETA + flying as f64 * (1.0 - FLYING_BETA);
            self.avg_flying.store(next.to_bits(), Ordering::Relaxed);
        }
    }

    fn should_drop(&self) -> bool {
        if (self.system_overloaded() || self.still_hot()) && self.high_thru() {
            tracing::warn!(
                cpu = self.probe.usage(),
                max_pass = self.max_pass(),
                min_rt = self.min_rt(),
                flying = self.flying.load(Ordering::Acquire),
                avg_flying = f64::from_bits(self.avg_flying.load(Ordering::Relaxed)),
                "dropping request"
            );
            return true;
        }
        false
    }

    fn system_overloaded(&self) -> bool {
        self.probe.usage() >= self.cpu_threshold
    }

    // inside the cool-off window after a drop, keep checking the throughput
    // gate even though CPU may have recovered
    fn still_hot(&self) -> bool {
        if !self.dropped_recently.load(Ordering::Acquire) {
            return false;
        }
        let drop_time = self.drop_time.load();
        if drop_time.is_zero() {
            return false;
        }
        let hot = self.clock.now().saturating_sub(drop_time) < COOL_OFF;
        if !hot {
            self.dropped_recently.store(false, Ordering::Release);
        }
        hot
    }

    fn high_thru(&self) -> bool {
        let avg_flying = {
            let _guard = self.avg_flying_lock.lock();
            f64::from_bits(self.avg_flying.load(Ordering::Relaxed))
        };
        let max_flight = self.max_flight();
        avg_flying as i64 > max_flight && self.flying.load(Ordering::Acquire) > max_flight
    }

    // max-flight = peak QPS x minimum RT: Little's law applied to the best
    // recent behavior
    fn max_flight(&self) -> i64 {
        let max_qps = (self.max_pass() * self.windows as i64) as f64;
        f64::max(1.0, max_qps * (self.min_rt() / 1000.0)) as i64
    }

    // largest per-bucket request count in the pass window
    fn max_pass(&self) -> i64 {
        let mut result = 1.0f64;
        self.pass_counter.reduce(|b| {
            if b.sum > result {
                result = b.sum;
            }
        });
        result as i64
    }

    // smallest per-bucket average response time, in milliseconds
    fn min_rt(&self) -> f64 {
        let mut result = DEFAULT_MIN_RT_MILLIS;
        self.rt_counter.reduce(|b| {
            if b.count == 0 {
                return;
            }
            let avg = (b.sum / b.count as f64).round();
            if avg < result {
                result = avg;
            }
        });
        result
    }
}

/// One-shot completion report handed out by [`Shedder::allow`].
///
/// [`pass`](Promise::pass) records the response time and feeds the
/// throughput statistics; [`fail`](Promise::fail) only releases the
/// in-flight slot. Dropping the promise without resolving it behaves like
/// `fail`, so the in-flight count cannot leak when a caller unwinds.
pub struct Promise {
    inner: Option<Arc<AdaptiveShedder>>,
    start: Duration,
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.inner.is_none())
            .field("start", &self.start)
            .finish()
    }
}

impl Promise {
    /// The request completed successfully.
    pub fn pass(mut self) {
        if let Some(shedder) = self.inner.take() {
            let rt = shedder.clock.now().saturating_sub(self.start);
            shedder.add_flying(-1);
            shedder.rt_counter.add((rt.as_secs_f64() * 1000.0).ceil());
            shedder.pass_counter.add(1.0);
        }
    }

    /// The request failed.
    pub fn fail(mut self) {
        if let Some(shedder) = self.inner.take() {
            shedder.add_flying(-1);
        }
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if let Some(shedder) = self.inner.take() {
            shedder.add_flying(-1);
        }
    }
}
