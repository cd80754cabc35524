// Middleware for resilient model host calls
//
// Provides per-class admission control, retry with backoff and per-caller
// rate limiting of the feature routes

pub mod concurrency_pool;
pub mod rate_limit;
pub mod retry;

// Re-export commonly used types
pub use concurrency_pool::{AdmissionError, ConcurrencyPools, PoolStats};
pub use rate_limit::{caller_key, RateDecision, RateLimiter};
pub use retry::{RetryAttempt, RetryExecutor, RetryPolicy};
