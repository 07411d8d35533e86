//! CPU utilization probe feeding the adaptive shedder.
//!
//! Utilization is expressed in permille (1000 = all cores busy) and smoothed
//! with an exponential moving average so short spikes do not flap the
//! shedder.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

/// Smoothed CPU utilization source.
pub trait CpuProbe: Send + Sync {
    /// Current utilization in `[0, 1000]` permille.
    fn usage(&self) -> i64;
}

// 250ms and 0.95 as beta count the average cpu load of roughly the past 5s
const REFRESH_INTERVAL: Duration = Duration::from_millis(250);
const BETA: f64 = 0.95;
// one log line per minute
const LOG_EVERY_TICKS: u64 = 240;

/// Probe fed by a background task sampling `/proc/stat`.
///
/// The task reads the aggregate cpu line every 250 ms, converts the delta to
/// permille, folds it into a `beta = 0.95` moving average and publishes the
/// result through an atomic. On platforms without `/proc/stat` the reading
/// stays at 0. The task exits once the probe is dropped.
#[derive(Debug)]
pub struct CpuSampler {
    usage: Arc<AtomicI64>,
}

impl CpuSampler {
    /// Spawn the sampling task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn() -> Self {
        let usage = Arc::new(AtomicI64::new(0));
        let shared = Arc::downgrade(&usage);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut prev: Option<CpuTimes> = None;
            let mut ticks: u64 = 0;
            loop {
                ticker.tick().await;
                let Some(usage) = shared.upgrade() else {
                    return;
                };
                if let Some(cur) = read_proc_stat() {
                    if let Some(prev) = prev {
                        let instant = instant_permille(prev, cur);
                        let smoothed = smooth(usage.load(Ordering::Relaxed), instant);
                        usage.store(smoothed, Ordering::Relaxed);
                    }
                    prev = Some(cur);
                }
                ticks += 1;
                if ticks % LOG_EVERY_TICKS == 0 {
                    tracing::debug!(cpu = usage.load(Ordering::Relaxed), "cpu usage");
                }
            }
        });
        Self { usage }
    }
}

impl CpuProbe for CpuSampler {
    fn usage(&self) -> i64 {
        self.usage.load(Ordering::Relaxed)
    }
}

/// Probe returning a caller-controlled constant, for tests and for forcing
/// the shedder open or closed.
#[derive(Debug, Default)]
pub struct FixedCpuProbe {
    usage: AtomicI64,
}

impl FixedCpuProbe {
    pub fn new(permille: i64) -> Self {
        Self { usage: AtomicI64::new(permille) }
    }

    pub fn set(&self, permille: i64) {
        self.usage.store(permille, Ordering::Relaxed);
    }
}

impl CpuProbe for FixedCpuProbe {
    fn usage(&self) -> i64 {
        self.usage.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

fn read_proc_stat() -> Option<CpuTimes> {
    let text = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(text.lines().next()?)
}

fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait both count as not-busy
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().sum();
    Some(CpuTimes { idle, total })
}

fn instant_permille(prev: CpuTimes, cur: CpuTimes) -> i64 {
    let idle = cur.idle.saturating_sub(prev.idle);
    let total = cur.total.saturating_sub(prev.total);
    if total == 0 {
        return 0;
    }
    let busy = total.saturating_sub(idle);
    (busy * 1000 / total) as i64
}

fn smooth(prev: i64, instant: i64) -> i64 {
    (prev as f64 * BETA + instant as f64 * (1.0 - BETA)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aggregate_cpu_line() {
        let times =
            parse_cpu_line("cpu  100 0 100 700 100 0 0 0 0 0").expect("parse");
        assert_eq!(times.idle, 800);
        assert_eq!(times.total, 1000);
    }

    #[test]
    fn rejects_non_cpu_lines() {
        assert!(parse_cpu_line("cpu0 1 2 3 4").is_none());
        assert!(parse_cpu_line("intr 12345").is_none());
    }

    #[test]
    fn permille_of_busy_delta() {
        let prev = CpuTimes { idle: 0, total: 0 };
        let cur = CpuTimes { idle: 800, total: 1000 };
        assert_eq!(instant_permille(prev, cur), 200);
    }

    #[test]
    fn zero_delta_reads_as_idle() {
        let t = CpuTimes { idle: 10, total: 20 };
        assert_eq!(instant_permille(t, t), 0);
    }

    #[test]
    fn smoothing_converges_and_stays_in_range() {
        let mut usage = 0;
        for _ in 0..200 {
            usage = smooth(usage, 1000);
            assert!((0..=1000).contains(&usage));
        }
        assert!(usage > 900, "ewma converged to {}", usage);
        for _ in 0..200 {
            usage = smooth(usage, 0);
            assert!((0..=1000).contains(&usage));
        }
        assert!(usage < 100);
    }

    #[test]
    fn fixed_probe_is_settable() {
        let probe = FixedCpuProbe::new(900);
        assert_eq!(probe.usage(), 900);
        probe.set(150);
        assert_eq!(probe.usage(), 150);
    }

    #[tokio::test]
    async fn sampler_task_stops_with_the_probe() {
        let sampler = CpuSampler::spawn();
        let weak = Arc::downgrade(&sampler.usage);
        drop(sampler);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(weak.upgrade().is_none());
    }
}
