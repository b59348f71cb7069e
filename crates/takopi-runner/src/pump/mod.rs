//! Rate-limited request pump.
//!
//! Outbound transport calls (progress edits, final messages) go through a
//! single pump so that per-scope throughput limits are respected globally:
//! the [`RateLimiter`] tracks the earliest allowed dispatch per scope key,
//! and the [`RequestPump`] orders, coalesces and executes the requests.

mod limiter;
mod queue;

pub use limiter::RateLimiter;
pub use queue::{Priority, PumpError, PumpRequest, PumpResult, RequestPump};
