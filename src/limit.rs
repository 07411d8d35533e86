//! Distributed rate limiting.
//!
//! Two independent limiters share a remote script store:
//!
//! - [`PeriodLimiter`]: fixed-window counter with TTL, optionally aligned to
//!   wall-clock boundaries.
//! - [`TokenLimiter`]: token bucket evaluated atomically at the store, with a
//!   process-local failover bucket while the store is unreachable.
//!
//! The store seam is [`store::ScriptStore`]: atomic evaluation of a named
//! script plus a liveness ping. [`store::MemoryStore`] is the in-process
//! implementation used in tests and single-node deployments.

pub mod period;
pub mod store;
pub mod token;

pub use period::{LimitState, PeriodLimiter, TakeError};
pub use store::{MemoryStore, Script, ScriptStore, StoreError};
pub use token::TokenLimiter;
