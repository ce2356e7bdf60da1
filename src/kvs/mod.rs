//! Key-value store subsystem.
//!
//! # Data Flow
//! ```text
//! Build time:
//!     StoreConfig (memory | redis)
//!     → builder resolves the named store
//!     → Store::open()
//!
//! Request time (authn):
//!     credential id → Store::get(id) → value | KvsError::NotFound
//!
//! Teardown:
//!     Store::close() from an entrypoint finalizer
//! ```
//!
//! # Design Decisions
//! - `NotFound` is the only absence signal and only `get` returns it
//! - Deleting an absent key succeeds
//! - Backends own their own per-call deadlines

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors returned by store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvsError {
    /// The key is not present. Sentinel, never a backend failure.
    #[error("key not found")]
    NotFound,

    /// The store has not been opened or was closed.
    #[error("store is closed")]
    Closed,

    /// The value could not be serialized for the backend.
    #[error("encode value: {0}")]
    Encode(String),

    /// The backend returned bytes that do not decode into a value.
    #[error("decode value: {0}")]
    Decode(String),

    /// The backend failed.
    #[error("backend: {0}")]
    Backend(String),

    /// The backend did not answer within the per-call deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl KvsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvsError::NotFound)
    }
}

/// A concurrent-safe mapping from string keys to values.
#[async_trait]
pub trait Store<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Prepare the store for use. Must be called before any other operation.
    async fn open(&self) -> Result<(), KvsError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), KvsError>;

    /// Fetch a value. Absent keys fail with [`KvsError::NotFound`].
    async fn get(&self, key: &str) -> Result<V, KvsError>;

    /// Insert or replace a value without expiry.
    async fn set(&self, key: &str, value: V) -> Result<(), KvsError>;

    /// Remove a value.
    async fn delete(&self, key: &str) -> Result<(), KvsError>;

    /// Report whether a live value exists.
    async fn exists(&self, key: &str) -> Result<bool, KvsError>;
}

/// A store whose entries may expire.
#[async_trait]
pub trait TtlStore<V>: Store<V>
where
    V: Send + Sync + 'static,
{
    /// Insert a value that expires after `ttl`. Setting a live key again
    /// restarts its timer.
    async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> Result<(), KvsError>;
}
