//! Client-side throttling breaker.
//!
//! The breaker keeps a rolling window of call outcomes and rejects new calls
//! with probability
//!
//! ```text
//! max(0, (total - protection - k * accepts) / (total + 1))
//! ```
//!
//! evaluated on every request. There is no discrete open/half-open/closed
//! machine: the admission probability rises smoothly as the downstream
//! recovers. See the Client-Side Throttling section of the Google SRE book,
//! Handling Overload.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::Clock;
use crate::error::Error;
use crate::window::RollingWindow;

const WINDOW: Duration = Duration::from_secs(10);
const BUCKETS: usize = 40;
// lower k is more sensitive
const K: f64 = 1.5;
// small samples never drop
const PROTECTION: f64 = 5.0;

/// Returned when the breaker decides to fast-fail a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct ServiceUnavailable;

/// Tests events against a probability, sharing one locked RNG.
struct Proba {
    rng: Mutex<StdRng>,
}

impl Proba {
    fn new() -> Self {
        Self { rng: Mutex::new(StdRng::from_entropy()) }
    }

    fn true_on(&self, proba: f64) -> bool {
        let mut rng = self.rng.lock().unwrap();
        rng.gen::<f64>() < proba
    }
}

struct Shared {
    k: f64,
    stat: RollingWindow,
    proba: Proba,
}

/// Adaptive client-side throttle over a 10 s / 40-bucket outcome window.
///
/// Two usage modes: [`allow`](Breaker::allow) hands back a [`Promise`] the
/// caller reports through, and the [`call`](Breaker::call) family runs an
/// async operation and classifies the outcome itself.
///
/// Clones share the same window.
#[derive(Clone)]
pub struct Breaker {
    inner: Arc<Shared>,
}

impl Default for Breaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Breaker {
    pub fn new() -> Self {
        let interval = WINDOW / BUCKETS as u32;
        Self::from_window(RollingWindow::new(BUCKETS, interval))
    }

    /// Breaker reading time from the given clock (useful for deterministic
    /// tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let interval = WINDOW / BUCKETS as u32;
        Self::from_window(RollingWindow::with_clock(BUCKETS, interval, clock))
    }

    fn from_window(stat: RollingWindow) -> Self {
        Self {
            inner: Arc::new(Shared { k: K, stat, proba: Proba::new() }),
        }
    }

    /// Check admission and return a [`Promise`] the caller must resolve with
    /// the call outcome.
    pub fn allow(&self) -> Result<Promise, ServiceUnavailable> {
        self.accept()?;
        Ok(Promise { breaker: self.clone() })
    }

    /// Run `op`, classifying `Ok` as success and `Err` as failure.
    pub async fn call<T, E, Fut, Op>(&self, op: Op) -> Result<T, Error<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(op, |result: &Result<T, E>| result.is_ok(), None::<fn(ServiceUnavailable) -> Result<T, E>>)
            .await
    }

    /// Run `op`, classifying the outcome with `acceptable`.
    ///
    /// `acceptable` sees the full result, so callers can treat selected
    /// errors (or selected successful responses) as failures.
    pub async fn call_with_acceptable<T, E, Fut, Op, A>(
        &self,
        op: Op,
        acceptable: A,
    ) -> Result<T, Error<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: Fn(&Result<T, E>) -> bool,
    {
        self.run(op, acceptable, None::<fn(ServiceUnavailable) -> Result<T, E>>).await
    }

    /// Run `op`; when the breaker rejects, answer from `fallback` instead of
    /// surfacing [`ServiceUnavailable`].
    pub async fn call_with_fallback<T, E, Fut, Op, F>(
        &self,
        op: Op,
        fallback: F,
    ) -> Result<T, Error<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        F: FnOnce(ServiceUnavailable) -> Result<T, E>,
    {
        self.run(op, |result: &Result<T, E>| result.is_ok(), Some(fallback)).await
    }

    /// Run `op` with both a fallback and a custom outcome classifier.
    pub async fn call_with_fallback_acceptable<T, E, Fut, Op, F, A>(
        &self,
        op: Op,
        fallback: F,
        acceptable: A,
    ) -> Result<T, Error<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        F: FnOnce(ServiceUnavailable) -> Result<T, E>,
        A: Fn(&Result<T, E>) -> bool,
    {
        self.run(op, acceptable, Some(fallback)).await
    }

    async fn run<T, E, Fut, Op, F, A>(
        &self,
        op: Op,
        acceptable: A,
        fallback: Option<F>,
    ) -> Result<T, Error<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        F: FnOnce(ServiceUnavailable) -> Result<T, E>,
        A: Fn(&Result<T, E>) -> bool,
    {
        if let Err(rejected) = self.accept() {
            return match fallback {
                Some(fallback) => fallback(rejected).map_err(Error::Inner),
                None => Err(Error::Unavailable),
            };
        }
        // a panic (or a future dropped mid-flight) still counts as a failure
        let guard = FailureGuard { breaker: Some(self.clone()) };
        let result = op().await;
        guard.disarm();
        self.record(acceptable(&result));
        result.map_err(Error::Inner)
    }

    fn accept(&self) -> Result<(), ServiceUnavailable> {
        let (accepts, total) = self.history();
        let weighted_accepts = self.inner.k * accepts as f64;
        // https://landing.google.com/sre/sre-book/chapters/handling-overload/#eq2101
        let drop_ratio =
            f64::max(0.0, (total as f64 - PROTECTION - weighted_accepts) / (total + 1) as f64);
        if drop_ratio <= 0.0 {
            return Ok(());
        }
        if self.inner.proba.true_on(drop_ratio) {
            return Err(ServiceUnavailable);
        }
        Ok(())
    }

    fn record(&self, success: bool) {
        if success {
            self.inner.stat.add(1.0);
        } else {
            self.inner.stat.add(0.0);
        }
    }

    /// Snapshot of the outcome window: `(accepts, total)`.
    pub fn history(&self) -> (u64, u64) {
        let mut accepts = 0u64;
        let mut total = 0u64;
        self.inner.stat.reduce(|b| {
            accepts += b.sum as u64;
            total += b.count;
        });
        (accepts, total)
    }
}

/// One-shot outcome report handed out by [`Breaker::allow`].
///
/// Consuming the promise makes double reporting unrepresentable. Dropping it
/// without reporting leaves the window untouched.
pub struct Promise {
    breaker: Breaker,
}

impl Promise {
    /// Tell the breaker the call succeeded.
    pub fn accept(self) {
        self.breaker.record(true);
    }

    /// Tell the breaker the call failed.
    pub fn reject(self) {
        self.breaker.record(false);
    }
}

struct FailureGuard {
    breaker: Option<Breaker>,
}

impl FailureGuard {
    fn disarm(mut self) {
        self.breaker = None;
    }
}

impl Drop for FailureGuard {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.record(false);
        }
    }
}
