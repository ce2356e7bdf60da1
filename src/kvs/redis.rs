//! Redis-backed store.
//!
//! Values are stored as JSON under `<prefix><key>`. Each command runs under
//! the configured per-call deadline.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

use super::{KvsError, Store, TtlStore};

/// A store that keeps values in Redis.
pub struct RedisStore<V> {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
    prefix: String,
    timeout: Duration,
    _value: PhantomData<fn() -> V>,
}

impl<V> RedisStore<V> {
    /// Create a store for the given `redis://` URL. No connection is made
    /// until [`Store::open`].
    pub fn new(url: &str, prefix: impl Into<String>, timeout: Duration) -> Result<Self, KvsError> {
        let client = redis::Client::open(url).map_err(|e| KvsError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
            prefix: prefix.into(),
            timeout,
            _value: PhantomData,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<ConnectionManager, KvsError> {
        self.conn.read().await.clone().ok_or(KvsError::Closed)
    }

    async fn deadline<T, F>(&self, fut: F) -> Result<T, KvsError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(KvsError::Backend(e.to_string())),
            Err(_) => Err(KvsError::Timeout(self.timeout)),
        }
    }
}

fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>, KvsError> {
    serde_json::to_vec(value).map_err(|e| KvsError::Encode(e.to_string()))
}

#[async_trait]
impl<V> Store<V> for RedisStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn open(&self) -> Result<(), KvsError> {
        let manager = match tokio::time::timeout(self.timeout, self.client.get_connection_manager()).await {
            Ok(Ok(manager)) => manager,
            Ok(Err(e)) => return Err(KvsError::Backend(e.to_string())),
            Err(_) => return Err(KvsError::Timeout(self.timeout)),
        };
        *self.conn.write().await = Some(manager);
        tracing::debug!(prefix = %self.prefix, "Redis store opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), KvsError> {
        self.conn.write().await.take();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<V, KvsError> {
        let mut conn = self.connection().await?;
        let raw: Option<Vec<u8>> = self.deadline(conn.get(self.key(key))).await?;
        let raw = raw.ok_or(KvsError::NotFound)?;
        serde_json::from_slice(&raw).map_err(|e| KvsError::Decode(e.to_string()))
    }

    async fn set(&self, key: &str, value: V) -> Result<(), KvsError> {
        let bytes = encode(&value)?;
        let mut conn = self.connection().await?;
        self.deadline(conn.set::<_, _, ()>(self.key(key), bytes)).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvsError> {
        let mut conn = self.connection().await?;
        self.deadline(conn.del::<_, ()>(self.key(key))).await
    }

    async fn exists(&self, key: &str) -> Result<bool, KvsError> {
        let mut conn = self.connection().await?;
        self.deadline(conn.exists::<_, bool>(self.key(key))).await
    }
}

#[async_trait]
impl<V> TtlStore<V> for RedisStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> Result<(), KvsError> {
        let bytes = encode(&value)?;
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.connection().await?;
        self.deadline(conn.pset_ex::<_, _, ()>(self.key(key), bytes, millis))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        let res = RedisStore::<String>::new("not a url", "", Duration::from_secs(1));
        assert!(matches!(res, Err(KvsError::Backend(_))));
    }

    #[tokio::test]
    async fn operations_before_open_are_closed() {
        let store: RedisStore<String> =
            RedisStore::new("redis://127.0.0.1:1/", "gw:", Duration::from_millis(100)).unwrap();
        assert_eq!(store.get("k").await, Err(KvsError::Closed));
        assert_eq!(store.key("k"), "gw:k");
    }
}
