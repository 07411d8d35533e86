//! Process-global registry of named breakers.
//!
//! Call sites that guard the same downstream (typically one RPC method) share
//! one breaker by name. Breakers are created lazily on first use and live for
//! the process lifetime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, OnceLock};

use crate::breaker::Breaker;
use crate::error::Error;

static BREAKERS: OnceLock<Mutex<HashMap<String, Breaker>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Breaker>> {
    BREAKERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch the breaker registered under `name`, creating it on first use.
pub fn get(name: &str) -> Breaker {
    let mut map = registry().lock().unwrap();
    map.entry(name.to_string()).or_default().clone()
}

/// Run `op` through the breaker named `name`, classifying `Ok` as success.
pub async fn do_call<T, E, Fut, Op>(name: &str, op: Op) -> Result<T, Error<E>>
where
    Op: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    get(name).call(op).await
}

/// Run `op` through the breaker named `name` with a custom outcome
/// classifier.
pub async fn do_with_acceptable<T, E, Fut, Op, A>(
    name: &str,
    op: Op,
    acceptable: A,
) -> Result<T, Error<E>>
where
    Op: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    A: Fn(&Result<T, E>) -> bool,
{
    get(name).call_with_acceptable(op, acceptable).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("TestError")]
    struct TestError;

    #[test]
    fn same_name_shares_counters() {
        let a = get("registry-shared");
        let b = get("registry-shared");
        a.allow().unwrap().accept();
        assert_eq!(b.history(), (1, 1));
    }

    #[test]
    fn different_names_are_independent() {
        let a = get("registry-independent-a");
        let b = get("registry-independent-b");
        a.allow().unwrap().reject();
        assert_eq!(b.history(), (0, 0));
    }

    #[tokio::test]
    async fn do_call_records_through_the_named_breaker() {
        let out = do_call("registry-do-call", || async { Ok::<_, TestError>(7) }).await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(get("registry-do-call").history(), (1, 1));
    }

    #[tokio::test]
    async fn do_with_acceptable_reclassifies() {
        let out = do_with_acceptable(
            "registry-acceptable",
            || async { Err::<(), _>(TestError) },
            |_| true,
        )
        .await;
        assert!(out.is_err());
        assert_eq!(get("registry-acceptable").history(), (1, 1));
    }
}
