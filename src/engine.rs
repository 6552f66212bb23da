/*!
 * Execution engine
 *
 * A [`Connector`] runs [`Operation`]s against pooled connections:
 *
 * ```text
 * execute(op, key)
 *   ├─ key given: single-flight; one caller runs, the rest share its outcome
 *   └─ run physical
 *        ├─ circuit breaker (unless absent or bypassed)
 *        └─ borrow → override timeout → run op → classify → restore timeout → return
 * ```
 *
 * Operations run on the calling task. The connector spawns only the pool
 * evictor and the shared execution of a keyed cancellable call.
 */

use crate::classify::{classify, classify_pool};
use crate::commands::Commands;
use crate::config::{ConnectorConfig, ProbeSettings};
use crate::endpoint::EndpointDescriptor;
use crate::error::{ConnectorError, Result, StoreError};
use crate::operation::{Operation, OperationKey};
use crate::prober::{ProbeReport, ReachabilityProber};
use crate::transport::StoreConnection;
use kvconnect_core_resilience::{
    CircuitBreaker, CircuitBreakerError, CircuitState, ConnectionFactory, ConnectionPool,
    PoolStats, PooledConnection, SingleFlight,
};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SharedValue = Arc<dyn Any + Send + Sync>;
type SharedOutcome = std::result::Result<SharedValue, ConnectorError>;

struct ConnectorInner<C: StoreConnection> {
    endpoint: EndpointDescriptor,
    pool: ConnectionPool<C>,
    breaker: Option<CircuitBreaker>,
    flights: SingleFlight<OperationKey, SharedOutcome>,
    probe: ProbeSettings,
    evictor: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Pooled, circuit-broken access to one end-point
///
/// Clones share the same pool, breaker and in-flight registry.
pub struct Connector<C: StoreConnection> {
    inner: Arc<ConnectorInner<C>>,
}

impl<C: StoreConnection> Clone for Connector<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: StoreConnection> Connector<C> {
    /// Build a connector. Nothing is connected until the first operation.
    ///
    /// An invalid `config` fails with `InvalidArguments`.
    pub fn new(
        endpoint: EndpointDescriptor,
        factory: Arc<dyn ConnectionFactory<C>>,
        config: &ConnectorConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| ConnectorError::invalid_arguments(err.to_string()).with_cause(err))?;

        let breaker = config
            .circuit_breaker_config()
            .map(|breaker_config| CircuitBreaker::new(endpoint.to_string(), breaker_config));

        Ok(Self {
            inner: Arc::new(ConnectorInner {
                pool: ConnectionPool::new(factory, config.pool_config()),
                breaker,
                flights: SingleFlight::new(),
                probe: config.probe.clone(),
                evictor: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                endpoint,
            }),
        })
    }

    /// Build a connector, start idle eviction and wait until the end-point
    /// answers a ping.
    ///
    /// Waits indefinitely while the end-point is unreachable; wrap the call in
    /// a timeout to bound start-up.
    pub async fn start(
        endpoint: EndpointDescriptor,
        factory: Arc<dyn ConnectionFactory<C>>,
        config: &ConnectorConfig,
    ) -> Result<Self> {
        let connector = Self::new(endpoint, factory, config)?;
        connector.start_evictor();

        let report = connector.await_reachable().await?;
        info!(
            endpoint = %connector.endpoint(),
            attempts = report.attempts,
            "Connector started"
        );
        Ok(connector)
    }

    /// Run the reachability prober with this connector's probe settings
    pub async fn await_reachable(&self) -> Result<ProbeReport> {
        ReachabilityProber::from_settings(&self.inner.probe)
            .await_reachable(self)
            .await
    }

    /// Spawn the pool's idle evictor if one is configured
    pub fn start_evictor(&self) {
        let mut evictor = self.inner.evictor.lock();
        if evictor.is_none() && !self.is_shut_down() {
            *evictor = self.inner.pool.spawn_evictor();
        }
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.inner.endpoint
    }

    /// Pool occupancy
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Breaker state, or `None` when the breaker is disabled
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.inner.breaker.as_ref().map(CircuitBreaker::state)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Execute an operation.
    ///
    /// With a key, concurrent calls for the same key share one physical
    /// execution and all receive its outcome. Without one, every call runs on
    /// its own.
    pub async fn execute<V>(&self, op: Operation<C, V>, key: Option<OperationKey>) -> Result<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        match key {
            None => self.run_physical(op).await,
            Some(key) => self.execute_shared(op, key).await,
        }
    }

    /// Like [`execute`](Self::execute), but gives up waiting once `cancel` fires.
    ///
    /// A cancelled caller gets an `UnexpectedError`. With a key, the shared
    /// execution runs on its own task and finishes for the other callers even
    /// when the caller that started it is cancelled. Without one, the
    /// execution is dropped and its connection is not reused.
    pub async fn execute_cancellable<V>(
        &self,
        op: Operation<C, V>,
        key: Option<OperationKey>,
        cancel: &CancellationToken,
    ) -> Result<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let Some(key) = key else {
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(interrupted()),
                result = self.run_physical(op) => result,
            };
        };

        let connector = self.clone();
        let shared = tokio::spawn(async move { connector.execute_shared(op, key).await });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(interrupted()),
            joined = shared => joined.unwrap_or_else(|err| {
                Err(ConnectorError::unexpected("Shared operation task failed").with_cause(err))
            }),
        }
    }

    async fn execute_shared<V>(&self, op: Operation<C, V>, key: OperationKey) -> Result<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let outcome = self
            .inner
            .flights
            .run(key.clone(), || async move {
                self.run_physical(op)
                    .await
                    .map(|value| Arc::new(value) as SharedValue)
            })
            .await;

        match outcome {
            Ok(Ok(value)) => (*value).downcast_ref::<V>().cloned().ok_or_else(|| {
                ConnectorError::unexpected(format!(
                    "Operation key {} is in flight with a different result type",
                    key
                ))
            }),
            Ok(Err(err)) => Err(err),
            Err(abandoned) => Err(ConnectorError::unexpected(format!(
                "In-flight operation for key {} was abandoned before completing",
                key
            ))
            .with_cause(abandoned)),
        }
    }

    /// One physical execution, gated by the circuit breaker
    async fn run_physical<V>(&self, op: Operation<C, V>) -> Result<V> {
        if self.is_shut_down() {
            return Err(ConnectorError::unexpected(format!(
                "Connector for {} has been shut down",
                self.inner.endpoint
            )));
        }

        let breaker = match &self.inner.breaker {
            Some(breaker) if !op.bypasses_circuit_breaker() => breaker,
            _ => return self.do_execute(op).await,
        };

        breaker
            .call(|| self.do_execute(op), ConnectorError::is_breaker_relevant)
            .await
            .map_err(|err| match err {
                CircuitBreakerError::CircuitOpen { .. } => {
                    debug!(endpoint = %self.inner.endpoint, "Circuit breaker denied call");
                    ConnectorError::circuit_open(&self.inner.endpoint)
                }
                CircuitBreakerError::OperationFailed(err) => err,
            })
    }

    /// Borrow, run, classify, restore, return
    async fn do_execute<V>(&self, op: Operation<C, V>) -> Result<V> {
        let endpoint = &self.inner.endpoint;
        let lease = self
            .inner
            .pool
            .acquire()
            .await
            .map_err(|err| classify_pool(&err, endpoint))?;

        let mut scope = LeaseScope::open(lease, op.command_timeout()).map_err(|err| {
            crate::classify::classify_store(&err, endpoint, None)
        })?;

        let func = op.into_func();
        let result = func(Commands::new(scope.connection())).await;
        result.map_err(|err| classify(err, endpoint, Some(scope.connection().timeout())))
    }

    /// Close the pool and release the transport. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(evictor) = self.inner.evictor.lock().take() {
            evictor.abort();
        }
        self.inner.pool.close();
        info!(endpoint = %self.inner.endpoint, "Connector shut down");
    }
}

fn interrupted() -> ConnectorError {
    ConnectorError::unexpected("Interrupted while waiting for operation result")
}

/// A lease with an optional timeout override.
///
/// Dropping it restores the saved timeout and returns the connection to the
/// pool; a connection whose timeout cannot be restored is closed instead.
struct LeaseScope<C: StoreConnection> {
    lease: PooledConnection<C>,
    saved_timeout: Option<Duration>,
}

impl<C: StoreConnection> LeaseScope<C> {
    fn open(
        mut lease: PooledConnection<C>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Self, StoreError> {
        let saved_timeout = match timeout {
            Some(timeout) => {
                let previous = lease.timeout();
                lease.set_timeout(timeout)?;
                Some(previous)
            }
            None => None,
        };
        Ok(Self {
            lease,
            saved_timeout,
        })
    }

    fn connection(&mut self) -> &mut C {
        &mut self.lease
    }
}

impl<C: StoreConnection> Drop for LeaseScope<C> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved_timeout.take() {
            if let Err(err) = self.lease.set_timeout(saved) {
                error!(
                    error = %err,
                    timeout_ms = saved.as_millis() as u64,
                    "Failed to restore command timeout, closing connection"
                );
                self.lease.mark_invalid();
            }
        }
    }
}

impl<C: StoreConnection> Drop for ConnectorInner<C> {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            warn!(endpoint = %self.endpoint, "Connector dropped without shutdown");
            if let Some(evictor) = self.evictor.get_mut().take() {
                evictor.abort();
            }
            self.pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::memory::{MemoryConnection, MemoryStore};
    use futures::FutureExt;

    fn connector(store: &MemoryStore, config: &ConnectorConfig) -> Connector<MemoryConnection> {
        Connector::new(
            EndpointDescriptor::from_config(config).unwrap(),
            Arc::new(store.clone()),
            config,
        )
        .unwrap()
    }

    fn get_op(key: &'static str) -> Operation<MemoryConnection, Option<bytes::Bytes>> {
        Operation::new(move |mut cmds| async move { Ok(cmds.get(key).await?) }.boxed())
    }

    #[tokio::test]
    async fn test_execute_returns_value_and_connection() {
        let store = MemoryStore::new("memory:engine");
        let connector = connector(&store, &ConnectorConfig::default());

        let set = Operation::new(|mut cmds| async move { Ok(cmds.set("k", "v").await?) }.boxed());
        connector.execute(set, None).await.unwrap();

        let value = connector.execute(get_op("k"), None).await.unwrap();
        assert_eq!(value.as_deref(), Some(b"v".as_slice()));

        assert_eq!(store.created(), 1);
        assert_eq!(connector.pool_stats().idle, 1);
        assert_eq!(connector.pool_stats().active, 0);
    }

    #[tokio::test]
    async fn test_timeout_override_is_restored() {
        let store = MemoryStore::with_timeout("memory:timeouts", Duration::from_secs(5));
        let connector = connector(&store, &ConnectorConfig::default());

        let seen = Operation::new(|mut cmds: crate::commands::Commands<'_, MemoryConnection>| {
            async move { Ok(cmds.connection().timeout()) }.boxed()
        })
        .with_command_timeout(Duration::from_millis(250));
        assert_eq!(
            connector.execute(seen, None).await.unwrap(),
            Duration::from_millis(250)
        );

        let after = Operation::new(|mut cmds: crate::commands::Commands<'_, MemoryConnection>| {
            async move { Ok(cmds.connection().timeout()) }.boxed()
        });
        assert_eq!(
            connector.execute(after, None).await.unwrap(),
            Duration::from_secs(5)
        );
        assert_eq!(store.created(), 1);
    }

    #[tokio::test]
    async fn test_failed_override_returns_connection() {
        let store = MemoryStore::new("memory:override");
        let connector = connector(&store, &ConnectorConfig::default());

        store.fail_timeout_changes(true);
        let op = get_op("k").with_command_timeout(Duration::from_millis(10));
        let err = connector.execute(op, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteError);
        assert_eq!(connector.pool_stats().idle, 1);
        assert_eq!(store.commands(), 0);
    }

    #[tokio::test]
    async fn test_failed_restore_disposes_connection() {
        let store = MemoryStore::new("memory:restore");
        let connector = connector(&store, &ConnectorConfig::default());

        let flip = {
            let store = store.clone();
            Operation::new(move |mut cmds| {
                async move {
                    let value = cmds.get("k").await?;
                    store.fail_timeout_changes(true);
                    Ok(value)
                }
                .boxed()
            })
            .with_command_timeout(Duration::from_millis(100))
        };

        assert!(connector.execute(flip, None).await.unwrap().is_none());
        assert_eq!(store.closed(), 1);
        assert_eq!(connector.pool_stats().total, 0);
    }

    #[tokio::test]
    async fn test_error_in_operation_is_classified_and_connection_returned() {
        let store = MemoryStore::new("memory:errors");
        let connector = connector(&store, &ConnectorConfig::default());

        store.fail_next_command(StoreError::CommandExecution("WRONGTYPE".into()));
        let err = connector.execute(get_op("k"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandExecution);
        assert_eq!(connector.pool_stats().idle, 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connect_failure() {
        let store = MemoryStore::new("memory:down");
        let connector = connector(&store, &ConnectorConfig::default());

        store.set_unreachable(true);
        let err = connector.execute(get_op("k"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectFailure);
        assert_eq!(connector.pool_stats().total, 0);
    }

    #[tokio::test]
    async fn test_key_type_mismatch_is_unexpected() {
        let store = MemoryStore::new("memory:types");
        let connector = connector(&store, &ConnectorConfig::default());
        store.set_latency(Duration::from_millis(50));

        let first = connector.execute(get_op("k"), Some("shared".into()));
        let second = connector.execute(
            Operation::new(|_cmds| async move { Ok(1u32) }.boxed()),
            Some("shared".into()),
        );
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err().kind(), ErrorKind::UnexpectedError);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let store = MemoryStore::new("memory:shutdown");
        let connector = connector(&store, &ConnectorConfig::default());
        connector.execute(get_op("k"), None).await.unwrap();

        connector.shutdown();
        connector.shutdown();
        assert!(connector.is_shut_down());
        assert_eq!(store.shutdowns(), 1);
        assert_eq!(store.live(), 0);

        let err = connector.execute(get_op("k"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedError);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let store = MemoryStore::new("memory:invalid");
        let mut config = ConnectorConfig::default();
        config.pool.max_total = 0;

        let err = Connector::new(
            EndpointDescriptor::from_config(&ConnectorConfig::default()).unwrap(),
            Arc::new(store.clone()),
            &config,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        assert_eq!(store.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_leader_abandons_waiters() {
        let store = MemoryStore::new("memory:abandon");
        let connector = connector(&store, &ConnectorConfig::default());
        store.set_latency(Duration::from_secs(1));

        let leader = tokio::time::timeout(
            Duration::from_millis(100),
            connector.execute(get_op("k"), Some("k".into())),
        );
        let waiter = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            connector.execute(get_op("k"), Some("k".into())).await
        };
        let (leader, waiter) = tokio::join!(leader, waiter);

        assert!(leader.is_err());
        let err = waiter.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedError);
        assert!(err.message().contains("abandoned"));
    }
}
