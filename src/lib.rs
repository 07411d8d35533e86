#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Breakwater
//!
//! Resilience and load-management primitives for RPC and HTTP services:
//! adaptive circuit breaking, CPU-aware load shedding, distributed rate
//! limiting, and a power-of-two-choices client-side balancer.
//!
//! ## Components
//!
//! - **[`window`]**: a concurrent, time-bucketed rolling counter, the
//!   statistics substrate shared by the breaker and the shedder.
//! - **[`breaker`]**: a probabilistic client-side throttle (Google SRE
//!   client-side throttling); no discrete open/half-open state, the
//!   admission probability tracks downstream health continuously.
//! - **[`shedder`]**: adaptive overload shedding from CPU pressure and
//!   observed concurrency, with a cool-off window against thrash.
//! - **[`limit`]**: fixed-window and token-bucket limiters evaluated
//!   atomically at a remote script store, with a process-local failover.
//! - **[`balancer`]**: P2C picker scored by EWMA latency with forced
//!   re-probing of penalized backends.
//!
//! A request typically flows shedder → breaker → balancer; each stage reads
//! its own statistics and the completed call feeds the next admission
//! decision.
//!
//! ## Quick start
//!
//! ```rust
//! use breakwater::Breaker;
//!
//! #[tokio::main]
//! async fn main() {
//!     let breaker = Breaker::new();
//!     let out = breaker
//!         .call(|| async { Ok::<_, std::io::Error>("downstream answer") })
//!         .await;
//!     assert!(out.is_ok());
//! }
//! ```

pub mod balancer;
pub mod breaker;
pub mod breaker_registry;
pub mod clock;
pub mod codes;
pub mod cpu;
pub mod error;
pub mod limit;
pub mod middleware;
pub mod shedder;
pub mod sync;
pub mod window;

// Re-exports
pub use balancer::{Address, Balancer, NoSubConnAvailable};
pub use breaker::{Breaker, ServiceUnavailable};
pub use clock::{Clock, MonotonicClock};
pub use codes::{RpcCode, Status};
pub use cpu::{CpuProbe, CpuSampler};
pub use error::Error;
pub use limit::{LimitState, MemoryStore, PeriodLimiter, ScriptStore, TokenLimiter};
pub use middleware::{BreakerLayer, ShedLayer};
pub use shedder::{ServiceOverloaded, Shedder};
pub use window::{Bucket, RollingWindow};
