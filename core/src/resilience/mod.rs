//! Degraded-mode handling for `EXCHANGE_UNAVAILABLE` (spec §4.4, §7): bounded
//! exponential backoff for individual calls, a circuit breaker that trips
//! after sustained failures so the gateway stops hammering a down exchange.

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
