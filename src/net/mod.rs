pub mod rate_limiter;
pub mod retry;

pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use retry::{Classify, FailureClass, RetryConfig, RetryPolicy, RetryStats};
