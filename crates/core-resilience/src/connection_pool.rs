//! Generic connection pool for reusable connections
//!
//! Provides bounded connection reuse with a max-wait on borrow, idle caps,
//! idle eviction and health checking. Leases are handed out as
//! [`PooledConnection`] guards: dropping a guard returns the connection to the
//! idle set, or disposes of it when the pool is closed or the idle set is full.

use super::error::ResilienceError;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections (leased + idle)
    pub max_total: usize,
    /// Maximum number of idle connections kept around
    pub max_idle: usize,
    /// Minimum number of idle connections the evictor keeps warm
    pub min_idle: usize,
    /// How long a borrow may wait for a free connection
    pub max_wait: Duration,
    /// Idle time after which a connection becomes eligible for eviction
    pub min_evictable_idle: Option<Duration>,
    /// Interval between evictor runs (`None` disables the evictor)
    pub eviction_interval: Option<Duration>,
    /// Maximum lifetime of a connection
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            min_idle: 0,
            max_wait: Duration::from_secs(30),
            min_evictable_idle: Some(Duration::from_secs(60)),
            eviction_interval: None,
            max_lifetime: None,
        }
    }
}

/// Factory trait for creating and validating connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Check if a connection is still healthy
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Close a connection
    fn close(&self, conn: T) {
        drop(conn);
    }

    /// Release client-wide resources once the pool is closed
    fn shutdown(&self) {}
}

/// An idle connection with its bookkeeping
struct IdleConnection<T> {
    conn: T,
    created_at: Instant,
    idle_since: Instant,
}

impl<T> IdleConnection<T> {
    fn is_expired(&self, config: &PoolConfig, now: Instant) -> bool {
        if let Some(idle_timeout) = config.min_evictable_idle {
            if now.duration_since(self.idle_since) > idle_timeout {
                return true;
            }
        }

        if let Some(max_lifetime) = config.max_lifetime {
            if now.duration_since(self.created_at) > max_lifetime {
                return true;
            }
        }

        false
    }
}

/// Internal pool state
struct PoolState<T> {
    /// Available connections, most recently returned last
    idle: Vec<IdleConnection<T>>,
    /// Live connections: idle, leased and being created
    total: usize,
    closed: bool,
}

struct PoolShared<T: Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Mutex<PoolState<T>>,
    semaphore: Arc<Semaphore>,
}

impl<T: Send + 'static> PoolShared<T> {
    fn give_back(&self, conn: T, created_at: Instant) {
        let mut state = self.state.lock();
        if state.closed || state.idle.len() >= self.config.max_idle {
            state.total -= 1;
            let closed = state.closed;
            drop(state);
            debug!(closed, "Disposing connection instead of returning it to the pool");
            self.factory.close(conn);
            return;
        }

        state.idle.push(IdleConnection {
            conn,
            created_at,
            idle_since: Instant::now(),
        });
    }

    fn dispose(&self, conn: T) {
        self.state.lock().total -= 1;
        self.factory.close(conn);
    }

    fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<IdleConnection<T>> = {
            let mut state = self.state.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|c| c.is_expired(&self.config, now));
            state.idle = keep;
            state.total -= expired.len();
            expired
        };

        let evicted = expired.len();
        for idle in expired {
            self.factory.close(idle.conn);
        }
        if evicted > 0 {
            debug!(evicted, "Evicted idle connections");
        }
        evicted
    }

    async fn ensure_min_idle(&self) -> Result<usize, ResilienceError> {
        let mut created = 0;
        loop {
            // Refill connections hold a permit while being created so that
            // leased + creating never exceeds max_total
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return Ok(created),
            };
            let reservation = {
                let mut state = self.state.lock();
                if state.closed
                    || state.idle.len() >= self.config.min_idle
                    || state.total >= self.config.max_total
                {
                    return Ok(created);
                }
                state.total += 1;
                Reservation::new(self)
            };

            let conn = self.factory.create().await?;
            reservation.defuse();
            self.give_back(conn, Instant::now());
            drop(permit);
            created += 1;
        }
    }
}

/// Undoes a `total` reservation unless defused
struct Reservation<'a, T: Send + 'static> {
    shared: &'a PoolShared<T>,
    armed: bool,
}

impl<'a, T: Send + 'static> Reservation<'a, T> {
    fn new(shared: &'a PoolShared<T>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl<T: Send + 'static> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state.lock().total -= 1;
        }
    }
}

/// A leased connection.
///
/// Derefs to the underlying connection. Dropping the lease returns the
/// connection to its pool.
pub struct PooledConnection<T: Send + 'static> {
    conn: Option<T>,
    created_at: Instant,
    pool: Arc<PoolShared<T>>,
    invalid: bool,
    // Released after the connection is back in the idle set
    permit: Option<OwnedSemaphorePermit>,
}

impl<T: Send + 'static> PooledConnection<T> {
    fn new(
        conn: T,
        created_at: Instant,
        pool: Arc<PoolShared<T>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            pool,
            invalid: false,
            permit: Some(permit),
        }
    }

    /// Close the connection instead of returning it
    pub fn invalidate(mut self) {
        self.mark_invalid();
    }

    /// Have the connection closed instead of returned once the lease is dropped
    pub fn mark_invalid(&mut self) {
        self.invalid = true;
    }

    fn discard(mut self) -> Option<OwnedSemaphorePermit> {
        if let Some(conn) = self.conn.take() {
            self.pool.dispose(conn);
        }
        self.permit.take()
    }
}

impl<T: Send + 'static> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only emptied by discard and drop, which consume the lease
        self.conn.as_ref().expect("lease holds a connection")
    }
}

impl<T: Send + 'static> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().expect("lease holds a connection")
    }
}

impl<T: Send + 'static> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.invalid {
                self.pool.dispose(conn);
            } else {
                self.pool.give_back(conn, self.created_at);
            }
        }
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// A generic connection pool
///
/// # Example
/// ```no_run
/// use kvconnect_core_resilience::{ConnectionPool, PoolConfig, ConnectionFactory, ResilienceError};
/// use std::sync::Arc;
///
/// # struct MyConnection { id: usize }
/// struct MyConnectionFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<MyConnection> for MyConnectionFactory {
///     async fn create(&self) -> Result<MyConnection, ResilienceError> {
///         Ok(MyConnection { id: 1 })
///     }
///
///     async fn is_healthy(&self, _conn: &MyConnection) -> bool {
///         true
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new(Arc::new(MyConnectionFactory), PoolConfig::default());
///
/// let conn = pool.acquire().await?;
/// assert_eq!(conn.id, 1);
/// drop(conn); // back to the pool
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a new connection pool
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> Self {
        let permits = config.max_total;
        Self {
            shared: Arc::new(PoolShared {
                config,
                factory,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    total: 0,
                    closed: false,
                }),
                semaphore: Arc::new(Semaphore::new(permits)),
            }),
        }
    }

    /// Create a connection pool with default configuration
    pub fn new_default(factory: Arc<dyn ConnectionFactory<T>>) -> Self {
        Self::new(factory, PoolConfig::default())
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Acquire a connection from the pool
    ///
    /// Reuses a healthy idle connection when one exists, otherwise creates a new
    /// one. When `max_total` connections are leased, waits up to `max_wait` for
    /// one to come back before failing with [`ResilienceError::PoolExhausted`].
    pub async fn acquire(&self) -> Result<PooledConnection<T>, ResilienceError> {
        let max_wait = self.shared.config.max_wait;
        let mut permit = match tokio::time::timeout(
            max_wait,
            Arc::clone(&self.shared.semaphore).acquire_owned(),
        )
        .await
        {
            Err(_) => return Err(ResilienceError::PoolExhausted(max_wait)),
            Ok(Err(_)) => return Err(ResilienceError::PoolClosed),
            Ok(Ok(permit)) => permit,
        };

        loop {
            let now = Instant::now();
            let candidate = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(ResilienceError::PoolClosed);
                }
                match state.idle.pop() {
                    Some(idle) => Some(idle),
                    None => {
                        state.total += 1;
                        None
                    }
                }
            };

            let Some(idle) = candidate else {
                break;
            };

            let expired = idle.is_expired(&self.shared.config, now);
            let lease =
                PooledConnection::new(idle.conn, idle.created_at, Arc::clone(&self.shared), permit);
            if !expired && self.shared.factory.is_healthy(&lease).await {
                return Ok(lease);
            }

            debug!(expired, "Discarding idle connection on borrow");
            permit = match lease.discard() {
                Some(permit) => permit,
                None => return Err(ResilienceError::PoolClosed),
            };
        }

        let reservation = Reservation::new(&self.shared);
        let conn = self.shared.factory.create().await?;
        reservation.defuse();
        Ok(PooledConnection::new(
            conn,
            Instant::now(),
            Arc::clone(&self.shared),
            permit,
        ))
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.total - state.idle.len(),
            total: state.total,
            max_total: self.shared.config.max_total,
        }
    }

    /// Close idle connections past their idle or lifetime limit
    pub fn evict_idle(&self) -> usize {
        self.shared.evict_idle()
    }

    /// Top the idle set up to `min_idle`
    pub async fn ensure_min_idle(&self) -> Result<usize, ResilienceError> {
        self.shared.ensure_min_idle().await
    }

    /// Spawn the background evictor if an eviction interval is configured.
    ///
    /// The task stops once the pool is closed or dropped.
    pub fn spawn_evictor(&self) -> Option<JoinHandle<()>> {
        let interval = self.shared.config.eviction_interval?;
        let weak: Weak<PoolShared<T>> = Arc::downgrade(&self.shared);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.state.lock().closed {
                    break;
                }

                shared.evict_idle();
                if let Err(e) = shared.ensure_min_idle().await {
                    warn!(error = %e, "Failed to replenish idle connections");
                }
            }
        }))
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close the pool: dispose of idle connections and reject further borrows.
    ///
    /// Connections still leased are disposed of when their lease is dropped.
    /// Calling `close` more than once has no further effect.
    pub fn close(&self) {
        let idle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.total -= idle.len();
            idle
        };

        self.shared.semaphore.close();
        for pooled in idle {
            self.shared.factory.close(pooled.conn);
        }
        self.shared.factory.shutdown();
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of idle connections
    pub idle: usize,
    /// Number of leased connections (including ones being created)
    pub active: usize,
    /// Total live connections (idle + active)
    pub total: usize,
    /// Maximum pool size
    pub max_total: usize,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_total == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_total as f64) * 100.0
        }
    }
}
