//! Failure handling around remote calls: circuit breakers, retry with
//! backoff, tiered timeouts and the per-kind policies driving them.

pub mod backoff;
pub mod breaker;
pub mod policy;
pub mod retry;
pub mod timeout;

pub use breaker::{BreakerError, BreakerStats, CircuitBreaker, CircuitState};
pub use policy::{BreakerConfig, PolicyError, PolicyRegistry, RetryConfig, TimeoutConfig};
pub use retry::RetryHandler;
pub use timeout::{TimeoutHandler, TimeoutTier};
