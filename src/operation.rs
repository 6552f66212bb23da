/*!
 * Units of work submitted to a connector
 */

use crate::commands::Commands;
use crate::transport::StoreConnection;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Body of an operation: runs against the commands of one leased connection
pub type OperationFn<C, V> =
    Box<dyn for<'a> FnOnce(Commands<'a, C>) -> BoxFuture<'a, anyhow::Result<V>> + Send>;

/// A unit of work with its execution options
///
/// # Example
/// ```no_run
/// use futures::FutureExt;
/// use kvconnect::operation::Operation;
/// use kvconnect::transport::memory::MemoryConnection;
/// use std::time::Duration;
///
/// let op: Operation<MemoryConnection, Option<bytes::Bytes>> =
///     Operation::new(|mut cmds| async move { Ok(cmds.get("user:42").await?) }.boxed())
///         .with_command_timeout(Duration::from_millis(250));
/// ```
pub struct Operation<C: StoreConnection, V> {
    func: OperationFn<C, V>,
    bypass_circuit_breaker: bool,
    command_timeout: Option<Duration>,
}

impl<C: StoreConnection, V> Operation<C, V> {
    pub fn new<F>(func: F) -> Self
    where
        F: for<'a> FnOnce(Commands<'a, C>) -> BoxFuture<'a, anyhow::Result<V>> + Send + 'static,
    {
        Self {
            func: Box::new(func),
            bypass_circuit_breaker: false,
            command_timeout: None,
        }
    }

    /// Run without consulting or feeding the circuit breaker
    pub fn bypass_circuit_breaker(mut self) -> Self {
        self.bypass_circuit_breaker = true;
        self
    }

    /// Use `timeout` as the connection's command timeout while this runs
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn bypasses_circuit_breaker(&self) -> bool {
        self.bypass_circuit_breaker
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    pub(crate) fn into_func(self) -> OperationFn<C, V> {
        self.func
    }
}

impl<C: StoreConnection> Operation<C, bool> {
    /// A liveness check answering whether the server replied `PONG`
    pub fn ping() -> Self {
        Self::new(|mut cmds| async move { Ok(cmds.ping().await?) }.boxed())
    }
}

impl<C: StoreConnection, V> fmt::Debug for Operation<C, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("bypass_circuit_breaker", &self.bypass_circuit_breaker)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

/// Identifies operations that may share one in-flight execution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey(Arc<str>);

impl OperationKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for OperationKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnection;

    #[test]
    fn test_builder_flags() {
        let op: Operation<MemoryConnection, bool> = Operation::ping();
        assert!(!op.bypasses_circuit_breaker());
        assert_eq!(op.command_timeout(), None);

        let op = op
            .bypass_circuit_breaker()
            .with_command_timeout(Duration::from_secs(1));
        assert!(op.bypasses_circuit_breaker());
        assert_eq!(op.command_timeout(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_key_equality() {
        assert_eq!(OperationKey::from("a"), OperationKey::new(String::from("a")));
        assert_ne!(OperationKey::from("a"), OperationKey::from("b"));
        assert_eq!(OperationKey::from("user:1").to_string(), "user:1");
    }
}
