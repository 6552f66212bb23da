/*!
 * Failure classification
 *
 * Maps whatever an operation body or the pool raised onto one [`ConnectorError`].
 * First match wins:
 *
 * 1. an already classified `ConnectorError` passes through unchanged
 * 2. a [`StoreError`] is classified by variant (connect, timeout, execution,
 *    conversion, closed connection, other remote error)
 * 3. an [`InvalidArgument`] becomes `InvalidArguments`
 * 4. the cause chain is searched for a `StoreError` or pool error
 * 5. anything else is an `UnexpectedError`
 */

use crate::error::{
    ConnectorError, ErrorKind, InvalidArgument, StoreError, CONNECTION_CLOSED,
};
use kvconnect_core_resilience::ResilienceError;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Classify an operation failure.
///
/// `timeout` is the connection's command timeout at the time of the failure,
/// quoted in timeout messages.
pub fn classify(
    err: anyhow::Error,
    endpoint: &dyn fmt::Display,
    timeout: Option<Duration>,
) -> ConnectorError {
    if let Some(classified) = err.downcast_ref::<ConnectorError>() {
        return classified.clone();
    }

    if let Some(store) = err.downcast_ref::<StoreError>() {
        return classify_store(store, endpoint, timeout);
    }

    if let Some(invalid) = err.downcast_ref::<InvalidArgument>() {
        return ConnectorError::invalid_arguments(invalid.to_string()).with_cause(invalid.clone());
    }

    for cause in err.chain().skip(1) {
        if let Some(store) = cause.downcast_ref::<StoreError>() {
            return classify_store(store, endpoint, timeout);
        }
        if let Some(pool) = cause.downcast_ref::<ResilienceError>() {
            return classify_pool(pool, endpoint);
        }
    }

    let message = format!("Unexpected error while executing operation: {:#}", err);
    let cause: Box<dyn StdError + Send + Sync> = err.into();
    ConnectorError::unexpected(message).with_shared_cause(Arc::from(cause))
}

/// Classify a transport error
pub fn classify_store(
    err: &StoreError,
    endpoint: &dyn fmt::Display,
    timeout: Option<Duration>,
) -> ConnectorError {
    let classified = match err {
        StoreError::Connect { .. } => ConnectorError::connect_failure(endpoint),
        StoreError::CommandTimeout { command } => {
            ConnectorError::new(ErrorKind::CommandTimeout, timeout_message(command, timeout))
        }
        StoreError::CommandExecution(message) => {
            ConnectorError::new(ErrorKind::CommandExecution, message.clone())
        }
        StoreError::Conversion(message) => {
            ConnectorError::new(ErrorKind::ProtocolConversion, message.clone())
        }
        StoreError::Remote(message) if message == CONNECTION_CLOSED => {
            ConnectorError::new(ErrorKind::ConnectionClosed, message.clone())
        }
        StoreError::Remote(message) => ConnectorError::new(ErrorKind::RemoteError, message.clone()),
    };
    classified.with_cause(err.clone())
}

/// Classify a failure to obtain a pooled connection
pub fn classify_pool(err: &ResilienceError, endpoint: &dyn fmt::Display) -> ConnectorError {
    match err {
        ResilienceError::PoolExhausted(_) | ResilienceError::Timeout(_) => ConnectorError::new(
            ErrorKind::PoolExhausted,
            format!("No pooled connection to {} became available: {}", endpoint, err),
        )
        .with_cause(err.clone()),
        ResilienceError::CircuitOpen => ConnectorError::circuit_open(endpoint),
        ResilienceError::ConnectionCreation(source) => {
            match source.downcast_ref::<StoreError>() {
                Some(store) => classify_store(store, endpoint, None),
                None => ConnectorError::unexpected(format!(
                    "Failed to obtain connection to {}: {}",
                    endpoint, source
                ))
                .with_shared_cause(Arc::clone(source)),
            }
        }
        ResilienceError::PoolClosed | ResilienceError::FlightAbandoned => {
            ConnectorError::unexpected(format!("{} ({})", err, endpoint)).with_cause(err.clone())
        }
    }
}

fn timeout_message(command: &str, timeout: Option<Duration>) -> String {
    match timeout {
        Some(timeout) if !timeout.is_zero() => {
            let millis = timeout.as_millis() as u64;
            format!(
                "Command {} timed out after {} (exactly {}ms)",
                command,
                human_duration(millis),
                group_thousands(millis)
            )
        }
        _ => format!("Command {} timed out", command),
    }
}

/// `1234567` → `"1,234,567"`
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(digit);
    }
    out
}

/// `65_020` → `"1 minute, 5 seconds, 20 milliseconds"`
pub fn human_duration(millis: u64) -> String {
    const UNITS: [(u64, &str); 5] = [
        (86_400_000, "day"),
        (3_600_000, "hour"),
        (60_000, "minute"),
        (1_000, "second"),
        (1, "millisecond"),
    ];

    let mut rest = millis;
    let mut parts = Vec::new();
    for (size, name) in UNITS {
        let count = rest / size;
        rest %= size;
        if count > 0 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", count, name, plural));
        }
    }

    if parts.is_empty() {
        "0 milliseconds".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str = "redis://cache:6379";

    fn classify_anyhow(err: anyhow::Error) -> ConnectorError {
        classify(err, &ENDPOINT, Some(Duration::from_millis(5000)))
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(5000), "5,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");

        assert_eq!(human_duration(0), "0 milliseconds");
        assert_eq!(human_duration(5000), "5 seconds");
        assert_eq!(human_duration(1000), "1 second");
        assert_eq!(human_duration(65_020), "1 minute, 5 seconds, 20 milliseconds");
    }

    #[test]
    fn test_timeout_message_quotes_connection_timeout() {
        let err = classify_anyhow(StoreError::timeout("GET").into());
        assert_eq!(err.kind(), ErrorKind::CommandTimeout);
        assert!(err.message().contains("5,000"), "{}", err.message());
        assert!(err.message().contains("5 seconds"), "{}", err.message());

        let without = classify(StoreError::timeout("GET").into(), &ENDPOINT, None);
        assert_eq!(without.message(), "Command GET timed out");
    }

    #[test]
    fn test_store_error_kinds() {
        let connect = classify_anyhow(StoreError::connect("cache:6379", "refused").into());
        assert_eq!(connect.kind(), ErrorKind::ConnectFailure);
        assert!(connect.message().contains(ENDPOINT));

        let execution =
            classify_anyhow(StoreError::CommandExecution("WRONGTYPE".into()).into());
        assert_eq!(execution.kind(), ErrorKind::CommandExecution);

        let conversion = classify_anyhow(StoreError::Conversion("bad int".into()).into());
        assert_eq!(conversion.kind(), ErrorKind::ProtocolConversion);

        let closed = classify_anyhow(StoreError::closed().into());
        assert_eq!(closed.kind(), ErrorKind::ConnectionClosed);

        let remote = classify_anyhow(StoreError::Remote("LOADING".into()).into());
        assert_eq!(remote.kind(), ErrorKind::RemoteError);
    }

    #[test]
    fn test_invalid_argument() {
        let err = classify_anyhow(InvalidArgument("empty key".into()).into());
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        assert!(!err.is_breaker_relevant());
    }

    #[test]
    fn test_classified_error_passes_through() {
        let original = ConnectorError::new(ErrorKind::PoolExhausted, "busy");
        let err = classify_anyhow(original.into());
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        assert_eq!(err.message(), "busy");
    }

    #[test]
    fn test_cause_chain_is_searched() {
        let wrapped = anyhow::Error::new(StoreError::closed()).context("loading profile");
        assert_eq!(classify_anyhow(wrapped).kind(), ErrorKind::ConnectionClosed);

        let pool = anyhow::Error::new(ResilienceError::PoolExhausted(Duration::from_secs(1)))
            .context("warming cache");
        assert_eq!(classify_anyhow(pool).kind(), ErrorKind::PoolExhausted);
    }

    #[test]
    fn test_unknown_error_is_unexpected() {
        let err = classify_anyhow(anyhow::anyhow!("boom"));
        assert_eq!(err.kind(), ErrorKind::UnexpectedError);
        assert!(err.message().contains("boom"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_pool_errors() {
        let created = ResilienceError::creation(StoreError::connect("cache:6379", "refused"));
        assert_eq!(classify_pool(&created, &ENDPOINT).kind(), ErrorKind::ConnectFailure);

        let other = ResilienceError::creation(std::io::Error::other("disk"));
        assert_eq!(classify_pool(&other, &ENDPOINT).kind(), ErrorKind::UnexpectedError);

        let closed = classify_pool(&ResilienceError::PoolClosed, &ENDPOINT);
        assert_eq!(closed.kind(), ErrorKind::UnexpectedError);

        let open = classify_pool(&ResilienceError::CircuitOpen, &ENDPOINT);
        assert!(open.is_connect_failure());
    }
}
