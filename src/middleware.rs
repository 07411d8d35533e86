//! Tower middleware wiring the shedder and the named breakers into a
//! service stack.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;

use crate::breaker_registry;
use crate::codes::{self, RpcCode};
use crate::error::Error;
use crate::shedder::Shedder;

type Classifier = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Layer that runs every request through a [`Shedder`] before the inner
/// service sees it.
///
/// A dropped request returns [`Error::Overloaded`] without invoking the
/// inner service. Completed requests report `pass` unless the classifier
/// marks the inner error as a capacity failure. The default classifier
/// reports `fail` exactly when [`codes::code_of`] finds a
/// [`DeadlineExceeded`](RpcCode::DeadlineExceeded) status in the error's
/// source chain: a blown deadline is work the process could not absorb,
/// while any other completion still counts toward observed throughput.
#[derive(Clone)]
pub struct ShedLayer {
    shedder: Shedder,
    fail_on: Classifier,
}

impl ShedLayer {
    pub fn new(shedder: Shedder) -> Self {
        Self {
            shedder,
            fail_on: Arc::new(|err| codes::code_of(err) == RpcCode::DeadlineExceeded),
        }
    }

    /// Replace the capacity-failure classifier.
    pub fn fail_on<F>(mut self, fail_on: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.fail_on = Arc::new(fail_on);
        self
    }
}

impl<S> Layer<S> for ShedLayer {
    type Service = ShedService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ShedService {
            inner: service,
            shedder: self.shedder.clone(),
            fail_on: self.fail_on.clone(),
        }
    }
}

/// Middleware service produced by [`ShedLayer`].
#[derive(Clone)]
pub struct ShedService<S> {
    inner: S,
    shedder: Shedder,
    fail_on: Classifier,
}

impl<S, Req> Service<Req> for ShedService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = Error<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Error::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let shedder = self.shedder.clone();
        let fail_on = self.fail_on.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let promise = shedder.allow().map_err(|_| Error::Overloaded)?;
            match inner.call(req).await {
                Ok(response) => {
                    promise.pass();
                    Ok(response)
                }
                Err(err) => {
                    if fail_on(&err) {
                        promise.fail();
                    } else {
                        // the work still completed; only capacity failures
                        // should depress the throughput statistics
                        promise.pass();
                    }
                    Err(Error::Inner(err))
                }
            }
        })
    }
}

/// Layer that runs every request through the process-global breaker
/// registered under a name (typically the full RPC method).
///
/// A rejected request returns [`Error::Unavailable`] without invoking the
/// inner service. Outcomes are classified by the acceptability predicate.
/// The default consults [`codes::acceptable`] on the status
/// [`codes::code_of`] finds in the error's source chain, so only
/// infrastructure-shaped codes (deadline exceeded, internal, unavailable,
/// data loss) count as failures; business errors and statusless errors
/// classify as [`Unknown`](RpcCode::Unknown) and count as successes.
#[derive(Clone)]
pub struct BreakerLayer {
    name: String,
    acceptable: Classifier,
}

impl BreakerLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            acceptable: Arc::new(|err| codes::acceptable(codes::code_of(err))),
        }
    }

    /// Replace the status-code classifier (e.g. to treat selected successful
    /// responses or extra error shapes as failures).
    pub fn acceptable<F>(mut self, acceptable: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.acceptable = Arc::new(acceptable);
        self
    }
}

impl<S> Layer<S> for BreakerLayer {
    type Service = BreakerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        BreakerService {
            inner: service,
            name: self.name.clone(),
            acceptable: self.acceptable.clone(),
        }
    }
}

/// Middleware service produced by [`BreakerLayer`].
#[derive(Clone)]
pub struct BreakerService<S> {
    inner: S,
    name: String,
    acceptable: Classifier,
}

impl<S, Req> Service<Req> for BreakerService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = Error<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Error::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let name = self.name.clone();
        let acceptable = self.acceptable.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let breaker = breaker_registry::get(&name);
            let promise = breaker.allow().map_err(|_| Error::Unavailable)?;
            match inner.call(req).await {
                Ok(response) => {
                    promise.accept();
                    Ok(response)
                }
                Err(err) => {
                    if acceptable(&err) {
                        promise.accept();
                    } else {
                        promise.reject();
                    }
                    Err(Error::Inner(err))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker_registry;
    use crate::clock::Clock;
    use crate::codes::Status;
    use crate::cpu::FixedCpuProbe;
    use crate::shedder::Promise;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::{service_fn, ServiceExt};

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("TestError: {0}")]
    struct TestError(&'static str);

    #[derive(Debug, Default)]
    struct ManualClock {
        nanos: AtomicU64,
    }

    impl ManualClock {
        fn advance(&self, d: Duration) {
            self.nanos.fetch_add(d.as_nanos() as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
        }
    }

    // shedder whose no-history max flight is 10 (1s window, 10 buckets)
    fn pressured_shedder(clock: Arc<ManualClock>) -> Shedder {
        let shedder = Shedder::builder(Arc::new(FixedCpuProbe::new(1000)))
            .window(Duration::from_secs(1))
            .buckets(10)
            .clock(clock.clone())
            .build();
        clock.advance(Duration::from_secs(1));
        shedder
    }

    // push the lagging concurrency average to 3 with 8 requests still held
    fn hold_under_load(shedder: &Shedder) -> Vec<Promise> {
        let mut held: Vec<Promise> = (0..12).map(|_| shedder.allow().unwrap()).collect();
        for _ in 0..4 {
            held.pop().unwrap().fail();
        }
        held
    }

    #[tokio::test]
    async fn shed_layer_passes_requests_through() {
        let layer = ShedLayer::new(Shedder::nop());
        let service = layer.layer(service_fn(|req: &'static str| async move {
            Ok::<_, TestError>(format!("handled: {}", req))
        }));
        let response = service.oneshot("ping").await.unwrap();
        assert_eq!(response, "handled: ping");
    }

    #[tokio::test]
    async fn shed_layer_drops_without_calling_inner() {
        let probe = Arc::new(FixedCpuProbe::new(1000));
        let shedder = Shedder::builder(probe)
            .window(Duration::from_secs(1))
            .buckets(10)
            .build();
        // push the average concurrency past the no-history max flight
        let mut held: Vec<_> = (0..30).map(|_| shedder.allow().unwrap()).collect();
        for _ in 0..10 {
            held.pop().unwrap().fail();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_seen = calls.clone();
        let layer = ShedLayer::new(shedder);
        let service = layer.layer(service_fn(move |_req: &'static str| {
            let calls = calls_seen.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>("unreachable")
            }
        }));

        let err = service.oneshot("ping").await.unwrap_err();
        assert!(err.is_overloaded());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "inner service must not run");
        drop(held);
    }

    #[tokio::test]
    async fn shed_layer_releases_the_slot_on_completion() {
        let shedder = Shedder::builder(Arc::new(FixedCpuProbe::new(0))).build();
        let layer = ShedLayer::new(shedder.clone());
        let service = layer.layer(service_fn(|_req: &'static str| async move {
            Err::<(), _>(TestError("inner failed"))
        }));
        let err = service.oneshot("ping").await.unwrap_err();
        assert!(err.is_inner());
        assert_eq!(shedder.flying(), 0);
    }

    // the pass/fail classification is observable through the next admission
    // decision: pass-classified completions feed the pass/rt windows and pull
    // max flight down from its no-history value of 10 to 1, fail-classified
    // completions leave the windows empty

    #[tokio::test]
    async fn deadline_failures_do_not_feed_the_throughput_stats() {
        let clock = Arc::new(ManualClock::default());
        let shedder = pressured_shedder(clock.clone());
        let service = ShedLayer::new(shedder.clone()).layer(service_fn(|_req: ()| async move {
            Err::<(), _>(Status::new(RpcCode::DeadlineExceeded, "blew the deadline"))
        }));
        for _ in 0..5 {
            let err = service.clone().oneshot(()).await.unwrap_err();
            assert!(err.is_inner());
        }

        // rotate the windows; the fail-classified completions left them
        // empty, so max flight is still 10 and an average of 3 admits
        clock.advance(Duration::from_millis(150));
        let held = hold_under_load(&shedder);
        assert!(shedder.allow().is_ok(), "deadline errors must not count as served work");
        drop(held);
    }

    #[tokio::test]
    async fn other_completions_feed_the_throughput_stats() {
        let clock = Arc::new(ManualClock::default());
        let shedder = pressured_shedder(clock.clone());
        // statusless errors classify as pass under the default classifier
        let service = ShedLayer::new(shedder.clone()).layer(service_fn(|_req: ()| async move {
            Err::<(), _>(TestError("plain failure"))
        }));
        for _ in 0..5 {
            let err = service.clone().oneshot(()).await.unwrap_err();
            assert!(err.is_inner());
        }

        // five passes with ~0ms observed rt pull max flight down to 1, so
        // the same load that admitted above now sheds
        clock.advance(Duration::from_millis(150));
        let held = hold_under_load(&shedder);
        assert!(shedder.allow().is_err(), "served completions must tighten max flight");
        drop(held);
    }

    #[tokio::test]
    async fn breaker_layer_passes_and_records() {
        let layer = BreakerLayer::new("mw-breaker-pass");
        let service = layer.layer(service_fn(|req: u32| async move { Ok::<_, TestError>(req * 2) }));
        assert_eq!(service.oneshot(21).await.unwrap(), 42);
        assert_eq!(breaker_registry::get("mw-breaker-pass").history(), (1, 1));
    }

    #[tokio::test]
    async fn breaker_layer_fast_fails_a_sick_downstream() {
        let name = "mw-breaker-sick";
        let breaker = breaker_registry::get(name);
        for _ in 0..200 {
            if let Ok(promise) = breaker.allow() {
                promise.reject();
            }
        }

        let layer = BreakerLayer::new(name);
        let mut saw_unavailable = false;
        for _ in 0..50 {
            let service = layer.clone().layer(service_fn(|_req: &'static str| async move {
                Err::<(), _>(TestError("still down"))
            }));
            if let Err(err) = service.oneshot("ping").await {
                if err.is_unavailable() {
                    saw_unavailable = true;
                    break;
                }
            }
        }
        assert!(saw_unavailable, "breaker never tripped at the layer");
    }

    #[tokio::test]
    async fn breaker_layer_acceptable_keeps_business_errors_green() {
        let name = "mw-breaker-acceptable";
        let layer = BreakerLayer::new(name).acceptable(|err| err.to_string().contains("not found"));
        let service = layer.layer(service_fn(|_req: &'static str| async move {
            Err::<(), _>(TestError("not found"))
        }));
        let err = service.oneshot("ping").await.unwrap_err();
        assert!(err.is_inner());
        assert_eq!(breaker_registry::get(name).history(), (1, 1));
    }

    #[tokio::test]
    async fn breaker_layer_default_classifies_by_status_code() {
        let name = "mw-breaker-status-default";
        let service = BreakerLayer::new(name).layer(service_fn(|sick: bool| async move {
            if sick {
                Err::<(), _>(Status::new(RpcCode::Unavailable, "downstream down"))
            } else {
                Err::<(), _>(Status::new(RpcCode::NotFound, "no such row"))
            }
        }));
        let _ = service.clone().oneshot(true).await;
        let _ = service.clone().oneshot(false).await;
        let _ = service.oneshot(false).await;
        // the unavailable status is the only recorded failure
        assert_eq!(breaker_registry::get(name).history(), (2, 3));
    }

    #[tokio::test]
    async fn breaker_layer_default_treats_statusless_errors_as_successes() {
        let name = "mw-breaker-statusless";
        let service = BreakerLayer::new(name).layer(service_fn(|_req: ()| async move {
            Err::<(), _>(TestError("no status attached"))
        }));
        let _ = service.oneshot(()).await;
        assert_eq!(breaker_registry::get(name).history(), (1, 1));
    }
}
