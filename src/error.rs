/*!
 * Error types for kvconnect
 *
 * Every failure a caller sees is a [`ConnectorError`]: an [`ErrorKind`] tag, a
 * message and an optional shared cause. Transports and operation bodies raise
 * the lower-level [`StoreError`] (or [`InvalidArgument`] for bad caller input);
 * the engine classifies those into a `ConnectorError`.
 */

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;

/// Classification of a failure surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The end-point could not be reached
    ConnectFailure,
    /// A command did not complete within the connection's timeout
    CommandTimeout,
    /// The server ran the command and replied with an error
    CommandExecution,
    /// A value could not be converted to or from its wire form
    ProtocolConversion,
    /// The connection was already closed
    ConnectionClosed,
    /// Any other transport-level failure
    RemoteError,
    /// The circuit breaker is open; no network call was attempted
    CircuitOpen,
    /// The caller's own input was rejected
    InvalidArguments,
    /// No pooled connection became available within the max-wait
    PoolExhausted,
    /// Anything else, including interrupted waits
    UnexpectedError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ConnectFailure => write!(f, "connect-failure"),
            ErrorKind::CommandTimeout => write!(f, "command-timeout"),
            ErrorKind::CommandExecution => write!(f, "command-execution-error"),
            ErrorKind::ProtocolConversion => write!(f, "protocol-conversion-error"),
            ErrorKind::ConnectionClosed => write!(f, "connection-closed"),
            ErrorKind::RemoteError => write!(f, "remote-error"),
            ErrorKind::CircuitOpen => write!(f, "circuit-open"),
            ErrorKind::InvalidArguments => write!(f, "invalid-arguments"),
            ErrorKind::PoolExhausted => write!(f, "pool-exhausted"),
            ErrorKind::UnexpectedError => write!(f, "unexpected-error"),
        }
    }
}

/// A classified failure
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConnectorError {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ConnectorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying error
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub(crate) fn with_shared_cause(mut self, cause: Arc<dyn StdError + Send + Sync>) -> Self {
        self.cause = Some(cause);
        self
    }

    /// The end-point could not be reached
    pub fn connect_failure(endpoint: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ConnectFailure,
            format!("Unable to connect to end-point {}", endpoint),
        )
    }

    /// The breaker denied the call
    pub fn circuit_open(endpoint: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!(
                "Denied connect attempt to end-point {} since circuit breaker is open",
                endpoint
            ),
        )
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnexpectedError, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this failure counts against the circuit breaker
    pub fn is_breaker_relevant(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConnectFailure | ErrorKind::ConnectionClosed
        )
    }

    /// Whether this failure means the end-point is (temporarily) unusable
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConnectFailure
                | ErrorKind::CircuitOpen
                | ErrorKind::ConnectionClosed
                | ErrorKind::CommandTimeout
        )
    }

    /// Connect failure, including calls rejected by an open breaker
    pub fn is_connect_failure(&self) -> bool {
        matches!(self.kind, ErrorKind::ConnectFailure | ErrorKind::CircuitOpen)
    }

    /// Check if the same call may succeed later
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::ConnectFailure
            | ErrorKind::CircuitOpen
            | ErrorKind::ConnectionClosed
            | ErrorKind::CommandTimeout
            | ErrorKind::PoolExhausted => true,

            ErrorKind::CommandExecution
            | ErrorKind::ProtocolConversion
            | ErrorKind::RemoteError
            | ErrorKind::InvalidArguments
            | ErrorKind::UnexpectedError => false,
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::InvalidArguments => EXIT_CONFIG,
            _ => EXIT_FAILURE,
        }
    }
}

/// Raw failure raised by a transport or an operation body
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Could not establish a connection
    #[error("Unable to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The command's deadline elapsed
    #[error("Command {command} timed out")]
    CommandTimeout { command: String },

    /// The server replied with an error
    #[error("{0}")]
    CommandExecution(String),

    /// A frame or value could not be converted
    #[error("Conversion failed: {0}")]
    Conversion(String),

    /// Any other transport failure
    #[error("{0}")]
    Remote(String),
}

/// Message carried by a [`StoreError::Remote`] for a closed connection
pub const CONNECTION_CLOSED: &str = "Connection closed";

impl StoreError {
    pub fn connect(endpoint: impl fmt::Display, reason: impl fmt::Display) -> Self {
        StoreError::Connect {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(command: impl Into<String>) -> Self {
        StoreError::CommandTimeout {
            command: command.into(),
        }
    }

    pub fn closed() -> Self {
        StoreError::Remote(CONNECTION_CLOSED.to_string())
    }
}

/// Rejected caller input
#[derive(Debug, Clone, Error)]
#[error("Invalid argument: {0}")]
pub struct InvalidArgument(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let connect = ConnectorError::connect_failure("localhost:6379");
        assert!(connect.is_breaker_relevant());
        assert!(connect.is_connectivity());
        assert!(connect.is_connect_failure());
        assert!(connect.is_retryable());

        let open = ConnectorError::circuit_open("localhost:6379");
        assert!(!open.is_breaker_relevant());
        assert!(open.is_connect_failure());
        assert!(open.message().contains("circuit breaker is open"));

        let closed = ConnectorError::new(ErrorKind::ConnectionClosed, CONNECTION_CLOSED);
        assert!(closed.is_breaker_relevant());
        assert!(!closed.is_connect_failure());

        let timeout = ConnectorError::new(ErrorKind::CommandTimeout, "slow");
        assert!(!timeout.is_breaker_relevant());
        assert!(timeout.is_connectivity());

        let invalid = ConnectorError::invalid_arguments("bad key");
        assert!(!invalid.is_breaker_relevant());
        assert!(!invalid.is_connectivity());
        assert!(!invalid.is_retryable());
        assert_eq!(invalid.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn test_cause_is_source() {
        let err = ConnectorError::connect_failure("db:6379")
            .with_cause(StoreError::connect("db:6379", "connection refused"));
        let source = err.source().expect("cause");
        assert!(source.to_string().contains("connection refused"));

        let cloned = err.clone();
        assert_eq!(cloned.kind(), ErrorKind::ConnectFailure);
        assert!(cloned.source().is_some());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::ConnectFailure.to_string(), "connect-failure");
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit-open");
        assert_eq!(ErrorKind::UnexpectedError.to_string(), "unexpected-error");
    }
}
