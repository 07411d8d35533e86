//! Client-side balancer seam: picker contracts, per-backend stats, and the
//! scheme registry.
//!
//! Service discovery drives [`Balancer::update`] with the current ready set;
//! the balancer asks its [`PickerBuilder`] for a fresh picker and swaps it in
//! whole. Old subconns are discarded, their counters are not migrated.

pub mod p2c;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use arc_swap::ArcSwap;

use crate::codes::RpcCode;

/// Initial health score of a fresh subconn.
pub(crate) const INIT_SUCCESS: u64 = 1000;
/// Health scores at or below this mark a subconn unhealthy.
pub(crate) const THROTTLE_SUCCESS: u64 = INIT_SUCCESS / 2;
/// Load reported for a subconn with a zero load product.
pub(crate) const PENALTY: i64 = i32::MAX as i64;

/// Returned when a picker has no ready backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no subconn available")]
pub struct NoSubConnAvailable;

/// Opaque backend address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub addr: String,
}

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

/// Per-call information handed to a pick.
#[derive(Debug, Clone, Default)]
pub struct PickInfo {
    /// Full method name of the call, when known.
    pub method: String,
}

/// Outcome of a finished call, reported through [`Done::complete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DoneInfo {
    pub code: RpcCode,
}

/// Per-backend connection statistics. All fields are atomics; no lock is
/// held while a call completes.
pub struct SubConn {
    // EWMA latency, nanoseconds
    pub(crate) lag: AtomicU64,
    pub(crate) inflight: AtomicI64,
    // health score, decayed toward 0 on failures and 1000 on successes
    pub(crate) success: AtomicU64,
    pub(crate) requests: AtomicI64,
    // end of the most recent call, nanoseconds since the picker clock origin
    pub(crate) last: AtomicI64,
    // when this conn was last picked, nanoseconds since the picker clock origin
    pub(crate) pick: AtomicI64,
    addr: Address,
}

impl SubConn {
    pub(crate) fn new(addr: Address) -> Self {
        Self {
            lag: AtomicU64::new(0),
            inflight: AtomicI64::new(0),
            success: AtomicU64::new(INIT_SUCCESS),
            requests: AtomicI64::new(0),
            last: AtomicI64::new(0),
            pick: AtomicI64::new(0),
            addr,
        }
    }

    pub fn address(&self) -> &Address {
        &self.addr
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// EWMA latency of recent calls.
    pub fn lag_nanos(&self) -> u64 {
        self.lag.load(Ordering::Relaxed)
    }

    pub(crate) fn healthy(&self) -> bool {
        self.success.load(Ordering::Relaxed) > THROTTLE_SUCCESS
    }

    /// Load metric: `sqrt(lag + 1) * (inflight + 1)`; a zero product reports
    /// the penalty value so idle-looking broken conns are not preferred.
    pub fn load(&self) -> i64 {
        let lag = ((self.lag.load(Ordering::Relaxed) + 1) as f64).sqrt() as i64;
        let load = lag * (self.inflight.load(Ordering::Acquire) + 1);
        if load == 0 {
            PENALTY
        } else {
            load
        }
    }
}

impl std::fmt::Debug for SubConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubConn")
            .field("addr", &self.addr.addr)
            .field("load", &self.load())
            .field("inflight", &self.inflight())
            .finish()
    }
}

/// One-shot completion callback for a picked call.
///
/// Dropping it without [`complete`](Done::complete) releases the in-flight
/// slot without feeding the latency and health statistics.
pub struct Done {
    conn: Arc<SubConn>,
    on_done: Option<Box<dyn FnOnce(DoneInfo) + Send>>,
}

impl std::fmt::Debug for Done {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Done")
            .field("conn", &self.conn)
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

impl Done {
    pub(crate) fn new(conn: Arc<SubConn>, on_done: Box<dyn FnOnce(DoneInfo) + Send>) -> Self {
        Self { conn, on_done: Some(on_done) }
    }

    /// Report the call outcome.
    pub fn complete(mut self, info: DoneInfo) {
        if let Some(on_done) = self.on_done.take() {
            on_done(info);
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if self.on_done.take().is_some() {
            self.conn.inflight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A successful pick: the chosen conn and its completion callback.
#[derive(Debug)]
pub struct Pick {
    pub conn: Arc<SubConn>,
    pub done: Done,
}

/// Chooses a subconn for each call.
pub trait Picker: Send + Sync {
    fn pick(&self, info: &PickInfo) -> Result<Pick, NoSubConnAvailable>;
}

/// Builds a fresh [`Picker`] from a ready set on every discovery change.
pub trait PickerBuilder: Send + Sync {
    fn build(&self, ready: &[Address]) -> Arc<dyn Picker>;
}

#[derive(Default)]
struct PickerSlot {
    picker: Option<Arc<dyn Picker>>,
}

/// Discovery-facing front: holds the current picker and swaps in a fresh one
/// on every ready-set update.
pub struct Balancer {
    builder: Arc<dyn PickerBuilder>,
    slot: ArcSwap<PickerSlot>,
}

impl Balancer {
    /// A balancer with no backends yet; [`pick`](Self::pick) errors until the
    /// first [`update`](Self::update).
    pub fn new(builder: Arc<dyn PickerBuilder>) -> Self {
        Self {
            builder,
            slot: ArcSwap::from_pointee(PickerSlot::default()),
        }
    }

    /// Rebuild the picker from a new ready set.
    pub fn update(&self, ready: &[Address]) {
        let picker = self.builder.build(ready);
        self.slot.store(Arc::new(PickerSlot { picker: Some(picker) }));
    }

    pub fn pick(&self, info: &PickInfo) -> Result<Pick, NoSubConnAvailable> {
        match &self.slot.load().picker {
            Some(picker) => picker.pick(info),
            None => Err(NoSubConnAvailable),
        }
    }
}

static SCHEMES: OnceLock<Mutex<HashMap<String, Arc<dyn PickerBuilder>>>> = OnceLock::new();

fn schemes() -> &'static Mutex<HashMap<String, Arc<dyn PickerBuilder>>> {
    SCHEMES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a picker builder under a scheme name.
pub fn register(name: &str, builder: Arc<dyn PickerBuilder>) {
    schemes().lock().unwrap().insert(name.to_string(), builder);
}

/// Look up a registered scheme.
pub fn lookup(name: &str) -> Option<Arc<dyn PickerBuilder>> {
    schemes().lock().unwrap().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SingleConnPicker {
        conn: Arc<SubConn>,
    }

    impl Picker for SingleConnPicker {
        fn pick(&self, _info: &PickInfo) -> Result<Pick, NoSubConnAvailable> {
            let conn = self.conn.clone();
            conn.inflight.fetch_add(1, Ordering::AcqRel);
            let done_conn = conn.clone();
            Ok(Pick {
                conn: conn.clone(),
                done: Done::new(
                    conn,
                    Box::new(move |_info| {
                        done_conn.inflight.fetch_sub(1, Ordering::AcqRel);
                    }),
                ),
            })
        }
    }

    struct SingleConnBuilder;

    impl PickerBuilder for SingleConnBuilder {
        fn build(&self, ready: &[Address]) -> Arc<dyn Picker> {
            Arc::new(SingleConnPicker {
                conn: Arc::new(SubConn::new(ready[0].clone())),
            })
        }
    }

    #[test]
    fn fresh_conn_is_healthy() {
        let conn = SubConn::new(Address::new("a:1"));
        assert!(conn.healthy());
        conn.success.store(THROTTLE_SUCCESS, Ordering::Relaxed);
        assert!(!conn.healthy());
    }

    #[test]
    fn load_penalizes_zero_product() {
        let conn = SubConn::new(Address::new("a:1"));
        assert_eq!(conn.load(), 1);
        conn.lag.store(99, Ordering::Relaxed);
        conn.inflight.store(4, Ordering::Relaxed);
        // sqrt(100) * 5
        assert_eq!(conn.load(), 50);
        conn.inflight.store(-1, Ordering::Relaxed);
        assert_eq!(conn.load(), PENALTY);
    }

    #[test]
    fn balancer_errors_before_first_update() {
        let balancer = Balancer::new(Arc::new(SingleConnBuilder));
        assert_eq!(balancer.pick(&PickInfo::default()).unwrap_err(), NoSubConnAvailable);
    }

    #[test]
    fn update_swaps_in_a_fresh_picker() {
        let balancer = Balancer::new(Arc::new(SingleConnBuilder));
        balancer.update(&[Address::new("a:1")]);
        let pick = balancer.pick(&PickInfo::default()).unwrap();
        assert_eq!(pick.conn.address().addr, "a:1");
        pick.done.complete(DoneInfo::default());

        // rebuilt set: counters start over
        balancer.update(&[Address::new("b:2")]);
        let pick = balancer.pick(&PickInfo::default()).unwrap();
        assert_eq!(pick.conn.address().addr, "b:2");
        assert_eq!(pick.conn.inflight(), 1);
    }

    #[test]
    fn dropping_done_releases_inflight() {
        let balancer = Balancer::new(Arc::new(SingleConnBuilder));
        balancer.update(&[Address::new("a:1")]);
        let pick = balancer.pick(&PickInfo::default()).unwrap();
        let conn = pick.conn.clone();
        assert_eq!(conn.inflight(), 1);
        drop(pick);
        assert_eq!(conn.inflight(), 0);
    }

    #[test]
    fn scheme_registry_round_trip() {
        register("test_scheme", Arc::new(SingleConnBuilder));
        assert!(lookup("test_scheme").is_some());
        assert!(lookup("missing_scheme").is_none());
    }
}
