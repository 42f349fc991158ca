//! Resilience: retry policy, rate limiting, and concurrency limiting for
//! pool-mediated operations.

pub mod concurrency;
pub mod config;
pub mod rate_limiter;
pub mod retry;

pub use concurrency::{ConcurrencyLimiter, ConcurrencyStats};
pub use config::{ConcurrencyConfig, RateLimitConfig, ResilienceConfig, RetryConfig};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use retry::{RetryPolicy, RetryableError};
