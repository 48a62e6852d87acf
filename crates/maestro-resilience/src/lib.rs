//! Fault isolation and retry sequencing around agent calls.
//!
//! - [`CircuitBreaker`] stops calling a repeatedly failing target for a cooldown.
//! - [`CircuitBreakerRegistry`] keeps one breaker per target for the process lifetime.
//! - [`RetryExecutor`] runs an operation under a [`RetryPolicy`], optionally through a breaker.

/// Circuit breaker state machine and registry.
pub mod circuit_breaker;
/// Retry strategies and the executor.
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot,
    CircuitState,
};
pub use retry::{RetryContext, RetryExecutor, RetryPolicy, RetryStrategy};
