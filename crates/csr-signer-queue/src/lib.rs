//! Work queue for controller object keys
//!
//! Keys are deduplicated while pending, never handed to two consumers at once,
//! and retried with per-key exponential backoff bounded by a global bucket.

#![deny(missing_docs)]

mod queue;
pub mod rate_limiter;

pub use queue::WorkQueue;
pub use rate_limiter::{default_controller_rate_limiter, RateLimiter};
