/*!
 * In-process transport
 *
 * A [`MemoryStore`] keeps its data in a map and hands out [`MemoryConnection`]s
 * through the pool. It can be told to refuse connects, fail timeout changes,
 * answer pings negatively, delay commands or fail upcoming commands, and it
 * counts what happened, so connector behaviour can be checked without a server.
 */

use crate::error::StoreError;
use crate::transport::StoreConnection;
use bytes::Bytes;
use kvconnect_core_resilience::{ConnectionFactory, ResilienceError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Default)]
struct Faults {
    refuse_connects: usize,
    refuse_all_connects: bool,
    command_failures: VecDeque<StoreError>,
    latency: Duration,
}

struct MemoryInner {
    name: String,
    data: Mutex<HashMap<Bytes, Bytes>>,
    faults: Mutex<Faults>,
    default_timeout: Duration,
    fail_set_timeout: AtomicBool,
    ping_fails: AtomicBool,
    epoch: AtomicU64,
    created: AtomicUsize,
    closed: AtomicUsize,
    commands: AtomicUsize,
    shutdowns: AtomicUsize,
}

/// Shared in-memory store; clones refer to the same data and counters
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timeout(name, Duration::from_secs(5))
    }

    /// Store whose connections start with `timeout` as their command timeout
    pub fn with_timeout(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                name: name.into(),
                data: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                default_timeout: timeout,
                fail_set_timeout: AtomicBool::new(false),
                ping_fails: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                created: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                commands: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            }),
        }
    }

    /// Open a connection directly, bypassing any pool
    pub fn open_connection(&self) -> Result<MemoryConnection, StoreError> {
        {
            let mut faults = self.inner.faults.lock();
            if faults.refuse_all_connects {
                return Err(StoreError::connect(&self.inner.name, "connection refused"));
            }
            if faults.refuse_connects > 0 {
                faults.refuse_connects -= 1;
                return Err(StoreError::connect(&self.inner.name, "connection refused"));
            }
        }

        let id = self.inner.created.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(store = %self.inner.name, id, "Opened memory connection");
        Ok(MemoryConnection {
            store: Arc::clone(&self.inner),
            id,
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            timeout: self.inner.default_timeout,
        })
    }

    /// Refuse the next `count` connects
    pub fn refuse_connects(&self, count: usize) {
        self.inner.faults.lock().refuse_connects = count;
    }

    /// Refuse every connect until turned off
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.faults.lock().refuse_all_connects = unreachable;
    }

    /// Fail the next command run on any connection with `error`
    pub fn fail_next_command(&self, error: StoreError) {
        self.inner.faults.lock().command_failures.push_back(error);
    }

    /// Delay every command by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.inner.faults.lock().latency = latency;
    }

    /// Make `set_timeout` fail on every connection
    pub fn fail_timeout_changes(&self, fail: bool) {
        self.inner.fail_set_timeout.store(fail, Ordering::SeqCst);
    }

    /// Make `PING` answer something other than `PONG`
    pub fn fail_pings(&self, fail: bool) {
        self.inner.ping_fails.store(fail, Ordering::SeqCst);
    }

    /// Break every connection opened so far
    pub fn drop_connections(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Connections opened so far
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Connections closed so far
    pub fn closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn live(&self) -> usize {
        self.created() - self.closed()
    }

    /// Commands received so far
    pub fn commands(&self) -> usize {
        self.inner.commands.load(Ordering::SeqCst)
    }

    /// Times the owning pool was shut down
    pub fn shutdowns(&self) -> usize {
        self.inner.shutdowns.load(Ordering::SeqCst)
    }

    /// Read a value without going through a connection
    pub fn peek(&self, key: impl AsRef<[u8]>) -> Option<Bytes> {
        self.inner.data.lock().get(key.as_ref()).cloned()
    }
}

#[async_trait::async_trait]
impl ConnectionFactory<MemoryConnection> for MemoryStore {
    async fn create(&self) -> Result<MemoryConnection, ResilienceError> {
        self.open_connection().map_err(ResilienceError::creation)
    }

    async fn is_healthy(&self, conn: &MemoryConnection) -> bool {
        conn.is_open()
    }

    fn shutdown(&self) {
        self.inner.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// A connection to a [`MemoryStore`]
pub struct MemoryConnection {
    store: Arc<MemoryInner>,
    id: usize,
    epoch: u64,
    timeout: Duration,
}

impl MemoryConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Common command prologue: liveness, injected failures, latency
    async fn begin(&mut self, command: &str) -> Result<(), StoreError> {
        if !self.is_open() {
            return Err(StoreError::closed());
        }
        self.store.commands.fetch_add(1, Ordering::SeqCst);

        let (failure, latency) = {
            let mut faults = self.store.faults.lock();
            (faults.command_failures.pop_front(), faults.latency)
        };
        if let Some(failure) = failure {
            return Err(failure);
        }

        if !latency.is_zero() {
            let budget = crate::config::timeout_for_command(self.timeout, command);
            if !budget.is_zero() && latency > budget {
                tokio::time::sleep(budget).await;
                return Err(StoreError::timeout(command));
            }
            tokio::time::sleep(latency).await;
        }

        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.store.closed.fetch_add(1, Ordering::SeqCst);
        trace!(store = %self.store.name, id = self.id, "Closed memory connection");
    }
}

#[async_trait::async_trait]
impl StoreConnection for MemoryConnection {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), StoreError> {
        if self.store.fail_set_timeout.load(Ordering::SeqCst) {
            return Err(StoreError::Remote("Unable to change command timeout".into()));
        }
        self.timeout = timeout;
        Ok(())
    }

    async fn ping(&mut self) -> Result<bool, StoreError> {
        self.begin("PING").await?;
        Ok(!self.store.ping_fails.load(Ordering::SeqCst))
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.begin("GET").await?;
        Ok(self.store.data.lock().get(key).cloned())
    }

    async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.begin("SET").await?;
        self.store
            .data
            .lock()
            .insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
        Ok(())
    }

    async fn del(&mut self, keys: &[&[u8]]) -> Result<u64, StoreError> {
        self.begin("DEL").await?;
        let mut data = self.store.data.lock();
        Ok(keys.iter().filter(|key| data.remove(**key).is_some()).count() as u64)
    }

    async fn mget(&mut self, keys: &[&[u8]]) -> Result<Vec<Option<Bytes>>, StoreError> {
        self.begin("MGET").await?;
        let data = self.store.data.lock();
        Ok(keys.iter().map(|key| data.get(*key).cloned()).collect())
    }

    async fn keys(&mut self, pattern: &[u8]) -> Result<Vec<Bytes>, StoreError> {
        self.begin("KEYS").await?;
        let data = self.store.data.lock();
        let mut keys: Vec<Bytes> = data
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn is_open(&self) -> bool {
        self.epoch == self.store.epoch.load(Ordering::SeqCst)
    }
}

/// `*` and `?` wildcard matching over bytes
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}
