//! Remote script-store seam for the limiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// A named server-side script evaluated atomically by the store.
///
/// The source is what a script-capable store (e.g. Redis) would run; stores
/// that cannot interpret arbitrary source may dispatch on
/// [`name`](Script::name) instead, as [`MemoryStore`] does.
#[derive(Debug, Clone, Copy)]
pub struct Script {
    name: &'static str,
    source: &'static str,
}

impl Script {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// Errors surfaced by a [`ScriptStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nil reply: the script signalled "no value". Distinct from failure;
    /// a false boolean script result surfaces this way.
    #[error("key missing")]
    Missing,
    /// The store could not be reached or answered out of protocol.
    #[error("store transport error: {0}")]
    Transport(String),
    /// The caller-supplied deadline fired before the store answered.
    #[error("store deadline exceeded")]
    DeadlineExceeded,
    /// The script ran but returned something unclassifiable.
    #[error("unexpected script reply: {0}")]
    UnexpectedReply(String),
}

/// Atomic script evaluation plus a liveness ping.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Atomically evaluate `script` against `keys` and `args`, returning its
    /// integer reply.
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError>;

    /// Liveness check.
    async fn ping(&self) -> bool;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process store interpreting the limiter scripts against a TTL'd map.
///
/// Dispatches on the script name; evaluation holds one mutex, which gives the
/// same atomicity the remote store guarantees. `down`/`up` toggle a simulated
/// outage for failover tests.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    down: AtomicBool,
    evals: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: evals fail with a transport error, pings fail.
    pub fn down(&self) {
        self.down.store(true, Ordering::Release);
    }

    /// End a simulated outage.
    pub fn up(&self) {
        self.down.store(false, Ordering::Release);
    }

    /// Number of evaluations that actually executed.
    pub fn evals(&self) -> u64 {
        self.evals.load(Ordering::Acquire)
    }

    fn get_live(data: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        let expired = match data.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| at <= Instant::now()),
            None => return None,
        };
        if expired {
            data.remove(key);
            return None;
        }
        data.get(key).map(|entry| entry.value.clone())
    }

    fn setex(data: &mut HashMap<String, Entry>, key: &str, ttl_secs: u64, value: String) {
        data.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
    }

    fn eval_period(
        data: &mut HashMap<String, Entry>,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        let key = first_key(keys)?;
        let limit: i64 = parse_arg(args, 0)?;
        let window: u64 = parse_arg(args, 1)?;
        let current = match Self::get_live(data, key) {
            Some(v) => v.parse::<i64>().map_err(|_| {
                StoreError::UnexpectedReply(format!("non-integer counter: {}", v))
            })? + 1,
            None => 1,
        };
        if current == 1 {
            Self::setex(data, key, window, current.to_string());
            return Ok(1);
        }
        // keep the original expiry: only the first increment sets the TTL
        if let Some(entry) = data.get_mut(key) {
            entry.value = current.to_string();
        }
        if current < limit {
            Ok(1)
        } else if current == limit {
            Ok(2)
        } else {
            Ok(0)
        }
    }

    fn eval_token(
        data: &mut HashMap<String, Entry>,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        let tokens_key = first_key(keys)?;
        let ts_key = keys
            .get(1)
            .ok_or_else(|| StoreError::UnexpectedReply("missing timestamp key".into()))?;
        let rate: f64 = parse_arg(args, 0)?;
        let capacity: f64 = parse_arg(args, 1)?;
        let now: f64 = parse_arg(args, 2)?;
        let requested: f64 = parse_arg(args, 3)?;

        let fill_time = capacity / rate;
        let ttl = (fill_time * 2.0).floor() as u64;
        let last_tokens = Self::get_live(data, tokens_key)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(capacity);
        let last_refreshed = Self::get_live(data, ts_key)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        let delta = (now - last_refreshed).max(0.0);
        let filled = (last_tokens + delta * rate).min(capacity);
        let allowed = filled >= requested;
        let new_tokens = if allowed { filled - requested } else { filled };
        Self::setex(data, tokens_key, ttl, new_tokens.to_string());
        Self::setex(data, ts_key, ttl, now.to_string());
        if allowed {
            Ok(1)
        } else {
            // a false boolean reply is a nil bulk reply on the wire
            Err(StoreError::Missing)
        }
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        if self.down.load(Ordering::Acquire) {
            return Err(StoreError::Transport("store is down".into()));
        }
        self.evals.fetch_add(1, Ordering::AcqRel);
        let mut data = self.data.lock().unwrap();
        match script.name() {
            crate::limit::period::SCRIPT_NAME => Self::eval_period(&mut data, keys, args),
            crate::limit::token::SCRIPT_NAME => Self::eval_token(&mut data, keys, args),
            other => Err(StoreError::UnexpectedReply(format!("unknown script: {}", other))),
        }
    }

    async fn ping(&self) -> bool {
        !self.down.load(Ordering::Acquire)
    }
}

fn first_key(keys: &[String]) -> Result<&str, StoreError> {
    keys.first()
        .map(String::as_str)
        .ok_or_else(|| StoreError::UnexpectedReply("missing key".into()))
}

fn parse_arg<T: std::str::FromStr>(args: &[String], idx: usize) -> Result<T, StoreError> {
    args.get(idx)
        .and_then(|a| a.parse().ok())
        .ok_or_else(|| StoreError::UnexpectedReply(format!("bad argument {}", idx)))
}
