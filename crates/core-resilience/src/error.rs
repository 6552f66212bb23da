//! Error types for the resilience primitives

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// No connection became available within the pool's max-wait
    #[error("Connection pool is exhausted, no connection available after {0:?}")]
    PoolExhausted(std::time::Duration),

    /// Pool was closed; no further leases are handed out
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Connection creation failed; the factory's error is kept as the source
    #[error("Failed to create connection: {0}")]
    ConnectionCreation(#[source] Arc<dyn StdError + Send + Sync>),

    /// Timeout occurred
    #[error("Operation timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The caller running a shared call went away before producing a result
    #[error("Shared in-flight call was abandoned before completing")]
    FlightAbandoned,
}

impl ResilienceError {
    /// Wrap a factory error as a creation failure
    pub fn creation<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ResilienceError::ConnectionCreation(Arc::new(err))
    }

    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::PoolExhausted(_)
                | ResilienceError::Timeout(_)
                | ResilienceError::ConnectionCreation(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(self, ResilienceError::PoolClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_classification() {
        let exhausted = ResilienceError::PoolExhausted(Duration::from_secs(1));
        assert!(exhausted.is_transient());
        assert!(!exhausted.is_permanent());

        let closed = ResilienceError::PoolClosed;
        assert!(!closed.is_transient());
        assert!(closed.is_permanent());

        let circuit_open = ResilienceError::CircuitOpen;
        assert!(!circuit_open.is_transient());
        assert!(!circuit_open.is_permanent());
    }

    #[test]
    fn test_creation_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ResilienceError::creation(io);
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "refused");
        assert!(err.to_string().contains("refused"));
    }
}
