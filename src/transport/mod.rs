/*!
 * Connection transports
 *
 * A transport supplies the physical connections the pool lends out. The engine
 * only relies on [`StoreConnection`]; the pool relies on the transport's
 * `ConnectionFactory` implementation to create, check and close them.
 */

pub mod memory;
pub mod resp;

use crate::error::StoreError;
use bytes::Bytes;
use std::time::Duration;

/// A single physical connection to the key-value store
#[async_trait::async_trait]
pub trait StoreConnection: Send + Sync + 'static {
    /// Current command timeout (zero means no timeout)
    fn timeout(&self) -> Duration;

    /// Change the command timeout for subsequent commands
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), StoreError>;

    /// Liveness check; `true` when the server answered `PONG`
    async fn ping(&mut self) -> Result<bool, StoreError>;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Delete keys, returning how many existed
    async fn del(&mut self, keys: &[&[u8]]) -> Result<u64, StoreError>;

    async fn mget(&mut self, keys: &[&[u8]]) -> Result<Vec<Option<Bytes>>, StoreError>;

    /// Keys matching a glob-style pattern
    async fn keys(&mut self, pattern: &[u8]) -> Result<Vec<Bytes>, StoreError>;

    /// Whether the connection can still carry commands
    fn is_open(&self) -> bool;
}
