//! Coordination primitives shared across processes
//!
//! Both the circuit breaker and the lease lock keep their state in the
//! `KvStore`, so every worker pointed at the same store sees the same breaker
//! state and contends for the same locks.

pub mod circuit_breaker;
pub mod lease;

pub use circuit_breaker::{
    CallPermit, CircuitBreakerConfig, CircuitBreakerRecord, CircuitState, SharedCircuitBreaker,
};
pub use lease::{LeaseConfig, LeaseGuard, LeaseLock};
