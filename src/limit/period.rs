//! Fixed-window request limiter.

use std::sync::Arc;

use chrono::Offset;

use crate::limit::store::{Script, ScriptStore, StoreError};

pub(crate) const SCRIPT_NAME: &str = "period_limit";

// KEYS[1] is spelled out instead of bound to a local to stay compatible with
// managed redis offerings
pub(crate) const PERIOD_SCRIPT: Script = Script::new(
    SCRIPT_NAME,
    r#"local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local current = redis.call("INCRBY", KEYS[1], 1)
if current == 1 then
    redis.call("expire", KEYS[1], window)
    return 1
elseif current < limit then
    return 1
elseif current == limit then
    return 2
else
    return 0
end"#,
);

const INTERNAL_OVER_QUOTA: i64 = 0;
const INTERNAL_ALLOWED: i64 = 1;
const INTERNAL_HIT_QUOTA: i64 = 2;

/// Outcome of a [`PeriodLimiter::take`] check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitState {
    /// The request is within quota.
    Allowed,
    /// The request exactly reaches the quota; callers can emit
    /// "last one through" telemetry.
    HitQuota,
    /// The quota is exhausted for the rest of the window.
    OverQuota,
}

/// Error from a [`PeriodLimiter::take`] check.
#[derive(Debug, thiserror::Error)]
pub enum TakeError {
    /// The store answered with a code outside the protocol.
    #[error("unknown status code")]
    UnknownStatus,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Limits requests per key to a quota within a fixed window.
///
/// The counter lives at the store under `{prefix}{key}` with a TTL equal to
/// the window, so state expires on its own. With
/// [`align`](PeriodLimiter::align) the window ends at the next multiple of
/// the period in the local timezone (e.g. `period = 86400` resets at local
/// midnight), which makes the remaining quota shrink toward the boundary.
pub struct PeriodLimiter<S> {
    period_secs: i64,
    quota: i64,
    store: Arc<S>,
    key_prefix: String,
    align: bool,
}

impl<S: ScriptStore> PeriodLimiter<S> {
    pub fn new(period_secs: i64, quota: i64, store: Arc<S>, key_prefix: impl Into<String>) -> Self {
        Self {
            period_secs,
            quota,
            store,
            key_prefix: key_prefix.into(),
            align: false,
        }
    }

    /// Align windows to wall-clock multiples of the period.
    pub fn align(mut self) -> Self {
        self.align = true;
        self
    }

    /// Request a permit for `key`.
    pub async fn take(&self, key: &str) -> Result<LimitState, TakeError> {
        let resp = self
            .store
            .eval(
                &PERIOD_SCRIPT,
                &[format!("{}{}", self.key_prefix, key)],
                &[self.quota.to_string(), self.calc_expire_seconds().to_string()],
            )
            .await?;
        match resp {
            INTERNAL_OVER_QUOTA => Ok(LimitState::OverQuota),
            INTERNAL_ALLOWED => Ok(LimitState::Allowed),
            INTERNAL_HIT_QUOTA => Ok(LimitState::HitQuota),
            _ => Err(TakeError::UnknownStatus),
        }
    }

    fn calc_expire_seconds(&self) -> i64 {
        if self.align {
            let now = chrono::Local::now();
            let offset = now.offset().fix().local_minus_utc() as i64;
            aligned_window(self.period_secs, now.timestamp() + offset)
        } else {
            self.period_secs
        }
    }
}

// seconds until the next multiple of `period` of the timezone-shifted epoch
fn aligned_window(period: i64, shifted_unix: i64) -> i64 {
    period - shifted_unix % period
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limit::store::MemoryStore;

    const DAY: i64 = 86_400;

    #[test]
    fn aligned_window_counts_down_to_the_boundary() {
        // 23:30:00 local -> half an hour left
        assert_eq!(aligned_window(DAY, 84_600), 1800);
        // midnight -> the full day
        assert_eq!(aligned_window(DAY, 0), DAY);
        // one second into the day
        assert_eq!(aligned_window(DAY, 1), DAY - 1);
        // works for arbitrary day counts since the epoch
        assert_eq!(aligned_window(DAY, 3 * DAY + 84_600), 1800);
    }

    #[tokio::test]
    async fn quota_walk_hits_then_overflows() {
        let limiter = PeriodLimiter::new(60, 3, Arc::new(MemoryStore::new()), "walk#");
        assert_eq!(limiter.take("k").await.unwrap(), LimitState::Allowed);
        assert_eq!(limiter.take("k").await.unwrap(), LimitState::Allowed);
        assert_eq!(limiter.take("k").await.unwrap(), LimitState::HitQuota);
        assert_eq!(limiter.take("k").await.unwrap(), LimitState::OverQuota);
        assert_eq!(limiter.take("k").await.unwrap(), LimitState::OverQuota);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = PeriodLimiter::new(60, 1, Arc::new(MemoryStore::new()), "indep#");
        assert_eq!(limiter.take("a").await.unwrap(), LimitState::Allowed);
        assert_eq!(limiter.take("b").await.unwrap(), LimitState::Allowed);
    }

    #[tokio::test]
    async fn store_errors_surface() {
        let store = Arc::new(MemoryStore::new());
        let limiter = PeriodLimiter::new(60, 1, store.clone(), "err#");
        store.down();
        let err = limiter.take("k").await.unwrap_err();
        assert!(matches!(err, TakeError::Store(StoreError::Transport(_))));
    }

    #[tokio::test]
    async fn unaligned_expiry_is_the_period() {
        let limiter = PeriodLimiter::new(120, 1, Arc::new(MemoryStore::new()), "exp#");
        assert_eq!(limiter.calc_expire_seconds(), 120);
    }

    #[tokio::test]
    async fn aligned_expiry_never_exceeds_the_period() {
        let limiter = PeriodLimiter::new(300, 1, Arc::new(MemoryStore::new()), "al#").align();
        let expire = limiter.calc_expire_seconds();
        assert!(expire > 0 && expire <= 300, "got {}", expire);
    }
}
