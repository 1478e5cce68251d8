//! Rate limiting, circuit breaking and retry scheduling.

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limit;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limit::{EndpointClass, FixedWindowRateLimiter, RateLimitDecision, RateLimitRule};
