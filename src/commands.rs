/*!
 * Command provider handed to operations
 */

use crate::codec::ValueCodec;
use crate::error::StoreError;
use crate::transport::StoreConnection;
use bytes::Bytes;

/// Commands bound to one leased connection for the duration of an operation
pub struct Commands<'a, C: StoreConnection> {
    conn: &'a mut C,
}

impl<'a, C: StoreConnection> Commands<'a, C> {
    pub(crate) fn new(conn: &'a mut C) -> Self {
        Self { conn }
    }

    pub async fn ping(&mut self) -> Result<bool, StoreError> {
        self.conn.ping().await
    }

    pub async fn get(&mut self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>, StoreError> {
        self.conn.get(key.as_ref()).await
    }

    pub async fn set(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<(), StoreError> {
        self.conn.set(key.as_ref(), value.as_ref()).await
    }

    pub async fn del<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<u64, StoreError> {
        let keys: Vec<&[u8]> = keys.iter().map(AsRef::as_ref).collect();
        self.conn.del(&keys).await
    }

    pub async fn mget<K: AsRef<[u8]>>(
        &mut self,
        keys: &[K],
    ) -> Result<Vec<Option<Bytes>>, StoreError> {
        let keys: Vec<&[u8]> = keys.iter().map(AsRef::as_ref).collect();
        self.conn.mget(&keys).await
    }

    pub async fn keys(&mut self, pattern: impl AsRef<[u8]>) -> Result<Vec<Bytes>, StoreError> {
        self.conn.keys(pattern.as_ref()).await
    }

    /// The underlying connection, for commands not covered here
    pub fn connection(&mut self) -> &mut C {
        self.conn
    }

    /// View these commands through a value codec
    pub fn typed<K: ValueCodec>(self, codec: &'a K) -> TypedCommands<'a, C, K> {
        TypedCommands {
            commands: self,
            codec,
        }
    }
}

/// Commands that encode and decode values with a [`ValueCodec`]
pub struct TypedCommands<'a, C: StoreConnection, K: ValueCodec> {
    commands: Commands<'a, C>,
    codec: &'a K,
}

impl<'a, C: StoreConnection, K: ValueCodec> TypedCommands<'a, C, K> {
    pub async fn get(&mut self, key: impl AsRef<[u8]>) -> Result<Option<K::Value>, StoreError> {
        match self.commands.get(key).await? {
            Some(raw) => self.codec.decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set(&mut self, key: impl AsRef<[u8]>, value: &K::Value) -> Result<(), StoreError> {
        let raw = self.codec.encode(value);
        self.commands.set(key, raw).await
    }

    pub async fn mget<Q: AsRef<[u8]>>(
        &mut self,
        keys: &[Q],
    ) -> Result<Vec<Option<K::Value>>, StoreError> {
        self.commands
            .mget(keys)
            .await?
            .into_iter()
            .map(|raw| raw.map(|raw| self.codec.decode(&raw)).transpose())
            .collect()
    }

    /// Back to the raw byte commands
    pub fn raw(&mut self) -> &mut Commands<'a, C> {
        &mut self.commands
    }
}
