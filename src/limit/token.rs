//! Token-bucket limiter evaluated at the remote store, with a process-local
//! failover bucket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::limit::store::{Script, ScriptStore, StoreError};

pub(crate) const SCRIPT_NAME: &str = "token_bucket";

// KEYS[1] holds the tokens, KEYS[2] the last refresh timestamp; both keys are
// spelled out to stay compatible with managed redis offerings
pub(crate) const TOKEN_SCRIPT: Script = Script::new(
    SCRIPT_NAME,
    r#"local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local fill_time = capacity/rate
local ttl = math.floor(fill_time*2)
local last_tokens = tonumber(redis.call("get", KEYS[1]))
if last_tokens == nil then
    last_tokens = capacity
end

local last_refreshed = tonumber(redis.call("get", KEYS[2]))
if last_refreshed == nil then
    last_refreshed = 0
end

local delta = math.max(0, now-last_refreshed)
local filled_tokens = math.min(capacity, last_tokens+(delta*rate))
local allowed = filled_tokens >= requested
local new_tokens = filled_tokens
if allowed then
    new_tokens = filled_tokens - requested
end

redis.call("setex", KEYS[1], ttl, new_tokens)
redis.call("setex", KEYS[2], ttl, now)

return allowed"#,
);

const PING_INTERVAL: Duration = Duration::from_millis(100);

/// In-process token bucket, the failover path while the store is down.
///
/// Replenishes `rate` tokens per second up to `burst`, starting full.
pub struct LocalLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<LocalState>,
}

struct LocalState {
    tokens: f64,
    last: SystemTime,
}

impl LocalLimiter {
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate: rate as f64,
            burst: burst as f64,
            state: Mutex::new(LocalState {
                tokens: burst as f64,
                last: SystemTime::now(),
            }),
        }
    }

    /// Whether `n` events may happen at `now`.
    pub fn allow_n(&self, now: SystemTime, n: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        let elapsed = now.duration_since(state.last).unwrap_or_default();
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        if now > state.last {
            state.last = now;
        }
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }
}

struct StoreHealth {
    alive: AtomicBool,
    monitor_started: Mutex<bool>,
}

/// Distributed token bucket: `rate` tokens per second, bursts up to `burst`.
///
/// The bucket state lives at the store under two keys, `{key}.tokens` and
/// `{key}.ts`, refreshed atomically by a script. When the store errors, the
/// limiter flips to a process-local bucket with the same parameters and
/// starts a singleton probe task that pings the store every 100 ms; once the
/// store answers, remote evaluation resumes and the remote state is
/// authoritative. The degradation is observable only through logs.
pub struct TokenLimiter<S> {
    rate: u64,
    burst: u64,
    store: Arc<S>,
    token_key: String,
    timestamp_key: String,
    rescue: LocalLimiter,
    health: Arc<StoreHealth>,
    eval_timeout: Option<Duration>,
}

impl<S: ScriptStore + 'static> TokenLimiter<S> {
    pub fn new(rate: u64, burst: u64, store: Arc<S>, key: &str) -> Self {
        Self {
            rate,
            burst,
            store,
            token_key: format!("{{{}}}.tokens", key),
            timestamp_key: format!("{{{}}}.ts", key),
            rescue: LocalLimiter::new(rate, burst),
            health: Arc::new(StoreHealth {
                alive: AtomicBool::new(true),
                monitor_started: Mutex::new(false),
            }),
            eval_timeout: None,
        }
    }

    /// Bound each store round-trip; an elapsed deadline fails over exactly
    /// like a transport error.
    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.eval_timeout = Some(timeout);
        self
    }

    /// Shorthand for `allow_n(SystemTime::now(), 1)`.
    pub async fn allow(&self) -> bool {
        self.allow_n(SystemTime::now(), 1).await
    }

    /// Whether `n` events may happen at `now`. Use this to drop or skip
    /// events exceeding the rate.
    pub async fn allow_n(&self, now: SystemTime, n: u64) -> bool {
        self.reserve_n(now, n).await
    }

    async fn reserve_n(&self, now: SystemTime, n: u64) -> bool {
        if !self.health.alive.load(Ordering::Acquire) {
            return self.rescue.allow_n(now, n);
        }
        let unix = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let keys = [self.token_key.clone(), self.timestamp_key.clone()];
        let args = [
            self.rate.to_string(),
            self.burst.to_string(),
            unix.to_string(),
            n.to_string(),
        ];
        let eval = self.store.eval(&TOKEN_SCRIPT, &keys, &args);
        let resp = match self.eval_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, eval).await {
                Ok(resp) => resp,
                Err(_) => Err(StoreError::DeadlineExceeded),
            },
            None => eval.await,
        };
        match resp {
            Ok(code) => code == 1,
            // a false boolean reply arrives as a nil bulk reply: not allowed,
            // and not a store failure
            Err(StoreError::Missing) => false,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "token limiter store failed, using in-process limiter for rescue"
                );
                self.start_monitor();
                self.rescue.allow_n(now, n)
            }
        }
    }

    // spawn the singleton health probe; the flag under the mutex keeps
    // concurrent failures from stacking probe tasks
    fn start_monitor(&self) {
        let mut started = self.health.monitor_started.lock().unwrap();
        if *started {
            return;
        }
        *started = true;
        self.health.alive.store(false, Ordering::Release);
        let health = self.health.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            // the immediate first tick; probes start one interval from now
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if store.ping().await {
                    health.alive.store(true, Ordering::Release);
                    tracing::info!("token limiter store recovered");
                    break;
                }
            }
            *health.monitor_started.lock().unwrap() = false;
        });
    }
}
