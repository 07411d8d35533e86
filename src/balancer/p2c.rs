//! Power-of-two-choices picker with EWMA latency scoring.
//!
//! Each pick draws two distinct backends and routes to the lighter one.
//! Latency and health decay by Newton's law of cooling (`exp(-td / tau)`,
//! `tau` = 10 s), so the weight of an observation depends on elapsed time
//! rather than sample count, which keeps the score robust under bursty
//! traffic. A backend that has not been picked for a second is force-picked
//! once so its score can recover when its latency normalizes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::balancer::{
    Address, Done, DoneInfo, NoSubConnAvailable, Pick, PickInfo, Picker, PickerBuilder, SubConn,
    INIT_SUCCESS,
};
use crate::clock::{Clock, MonotonicClock};
use crate::codes;
use crate::sync::AtomicDuration;

/// Scheme name this picker registers under.
pub const NAME: &str = "p2c_ewma";

// default value from finagle
const DECAY_TIME_NANOS: f64 = Duration::from_secs(10).as_nanos() as f64;
const FORCE_PICK_NANOS: i64 = Duration::from_secs(1).as_nanos() as i64;
const PICK_TIMES: usize = 3;
const LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Builds a [`P2cPicker`] per ready set.
#[derive(Clone)]
pub struct P2cPickerBuilder {
    clock: Arc<dyn Clock>,
}

impl Default for P2cPickerBuilder {
    fn default() -> Self {
        Self { clock: Arc::new(MonotonicClock::new()) }
    }
}

impl P2cPickerBuilder {
    /// Build pickers reading time from the given clock (useful for
    /// deterministic tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl PickerBuilder for P2cPickerBuilder {
    fn build(&self, ready: &[Address]) -> Arc<dyn Picker> {
        if ready.is_empty() {
            return Arc::new(EmptyPicker);
        }
        let conns = ready
            .iter()
            .map(|addr| Arc::new(SubConn::new(addr.clone())))
            .collect();
        Arc::new(P2cPicker {
            conns: Arc::new(conns),
            rng: Mutex::new(StdRng::from_entropy()),
            stamp: Arc::new(AtomicDuration::zero()),
            clock: self.clock.clone(),
        })
    }
}

/// Register the `p2c_ewma` scheme with the global balancer registry.
pub fn register() {
    crate::balancer::register(NAME, Arc::new(P2cPickerBuilder::default()));
}

struct EmptyPicker;

impl Picker for EmptyPicker {
    fn pick(&self, _info: &PickInfo) -> Result<Pick, NoSubConnAvailable> {
        Err(NoSubConnAvailable)
    }
}

/// EWMA-scored pick-two picker over one ready set.
pub struct P2cPicker {
    conns: Arc<Vec<Arc<SubConn>>>,
    rng: Mutex<StdRng>,
    stamp: Arc<AtomicDuration>,
    clock: Arc<dyn Clock>,
}

impl Picker for P2cPicker {
    fn pick(&self, _info: &PickInfo) -> Result<Pick, NoSubConnAvailable> {
        let mut rng = self.rng.lock().unwrap();
        let chosen = match self.conns.len() {
            0 => return Err(NoSubConnAvailable),
            1 => self.choose(&self.conns[0], None),
            2 => self.choose(&self.conns[0], Some(&self.conns[1])),
            n => {
                let mut node1 = &self.conns[0];
                let mut node2 = &self.conns[1];
                for _ in 0..PICK_TIMES {
                    let a = rng.gen_range(0..n);
                    let mut b = rng.gen_range(0..n - 1);
                    // avoid drawing the same backend twice
                    if b >= a {
                        b += 1;
                    }
                    node1 = &self.conns[a];
                    node2 = &self.conns[b];
                    if node1.healthy() && node2.healthy() {
                        break;
                    }
                }
                self.choose(node1, Some(node2))
            }
        };
        drop(rng);

        chosen.inflight.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        chosen.requests.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        let done = self.build_done(chosen.clone());
        Ok(Pick { conn: chosen, done })
    }
}

impl P2cPicker {
    // order the pair so c2 carries the higher load, then take the lighter
    // one unless the heavier is due a forced probe
    fn choose(&self, c1: &Arc<SubConn>, c2: Option<&Arc<SubConn>>) -> Arc<SubConn> {
        use std::sync::atomic::Ordering;

        let start = self.clock.now().as_nanos() as i64;
        let Some(c2) = c2 else {
            c1.pick.store(start, Ordering::Release);
            return c1.clone();
        };
        let (c1, c2) = if c1.load() > c2.load() { (c2, c1) } else { (c1, c2) };

        let pick = c2.pick.load(Ordering::Acquire);
        if start - pick > FORCE_PICK_NANOS
            && c2.pick.compare_exchange(pick, start, Ordering::AcqRel, Ordering::Acquire).is_ok()
        {
            return c2.clone();
        }

        c1.pick.store(start, Ordering::Release);
        c1.clone()
    }

    fn build_done(&self, conn: Arc<SubConn>) -> Done {
        use std::sync::atomic::Ordering;

        let clock = self.clock.clone();
        let conns = self.conns.clone();
        let stamp = self.stamp.clone();
        let start = clock.now().as_nanos() as i64;
        let done_conn = conn.clone();
        Done::new(
            conn,
            Box::new(move |info: DoneInfo| {
                let c = done_conn;
                c.inflight.fetch_sub(1, Ordering::AcqRel);
                let now = clock.now();
                let now_nanos = now.as_nanos() as i64;
                let last = c.last.swap(now_nanos, Ordering::AcqRel);
                let td = (now_nanos - last).max(0);
                let mut w = (-(td as f64) / DECAY_TIME_NANOS).exp();
                let lag = (now_nanos - start).max(0);
                let old_lag = c.lag.load(Ordering::Relaxed);
                if old_lag == 0 {
                    // first sample stands alone
                    w = 0.0;
                }
                c.lag.store(
                    (old_lag as f64 * w + lag as f64 * (1.0 - w)) as u64,
                    Ordering::Relaxed,
                );
                let success = if codes::acceptable(info.code) { INIT_SUCCESS } else { 0 };
                let old_success = c.success.load(Ordering::Relaxed);
                c.success.store(
                    (old_success as f64 * w + success as f64 * (1.0 - w)) as u64,
                    Ordering::Relaxed,
                );

                let stamp_val = stamp.load();
                if now.saturating_sub(stamp_val) >= LOG_INTERVAL
                    && stamp.compare_and_swap(stamp_val, now)
                {
                    log_stats(&conns);
                }
            }),
        )
    }
}

fn log_stats(conns: &[Arc<SubConn>]) {
    use std::sync::atomic::Ordering;

    let stats: Vec<String> = conns
        .iter()
        .map(|c| {
            format!(
                "conn: {}, load: {}, reqs: {}",
                c.address().addr,
                c.load(),
                c.requests.swap(0, Ordering::AcqRel),
            )
        })
        .collect();
    tracing::info!("p2c - {}", stats.join("; "));
}
