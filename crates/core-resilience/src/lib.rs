//! kvconnect Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! Building blocks for talking to a remote service that can fail transiently:
//!
//! - **Circuit Breaker**: Fails fast while a service is unhealthy, using ratio thresholds
//!   over a rolling window of recent outcomes
//! - **Connection Pool**: Bounded connection reuse with max-wait, idle caps and eviction
//! - **Single-Flight**: Collapses concurrent calls for the same key into one call
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of wire protocols or of
//! what a connection actually is. Callers supply a [`ConnectionFactory`] and a
//! failure predicate; the primitives do the bookkeeping.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Single-Flight                     │  ← One call per key
//! │  (Followers share the leader's result)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Rolling window, ratio thresholds)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool                   │  ← Resource efficiency
//! │  (Leases, health checks, eviction)      │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         Remote Service
//! ```
//!
//! # Usage Example
//!
//! ## Basic Circuit Breaker
//!
//! ```no_run
//! use kvconnect_core_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::from_counts(3, 5, 2, 2, Duration::from_secs(30));
//! let breaker = CircuitBreaker::new("store", config);
//!
//! let result = breaker
//!     .call(|| async { Ok::<_, std::io::Error>(42) }, |_err| true)
//!     .await;
//!
//! match result {
//!     Ok(value) => assert_eq!(value, 42),
//!     Err(CircuitBreakerError::CircuitOpen { component }) => eprintln!("{component} is down"),
//!     Err(CircuitBreakerError::OperationFailed(e)) => eprintln!("call failed: {e}"),
//! }
//! # }
//! ```
//!
//! ## Single-Flight
//!
//! ```no_run
//! use kvconnect_core_resilience::SingleFlight;
//!
//! # async fn example() {
//! let flights: SingleFlight<String, u64> = SingleFlight::new();
//! let value = flights.run("user:42".to_string(), || async { 7 }).await;
//! assert_eq!(value.ok(), Some(7));
//! # }
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod single_flight;

// Re-export main types for convenience
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, Ratio,
};
pub use connection_pool::{
    ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection,
};
pub use error::ResilienceError;
pub use single_flight::{Flight, FlightFollower, FlightLeader, SingleFlight};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use kvconnect_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig};
    pub use super::error::ResilienceError;
    pub use super::single_flight::SingleFlight;
}
