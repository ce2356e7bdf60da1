//! In-memory store with per-key expiry timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use super::{KvsError, Store, TtlStore};

/// Expiry timer for one key. The generation guards against a timer that
/// fired concurrently with a reset.
struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Table<V> {
    items: HashMap<String, V>,
    timers: HashMap<String, Timer>,
}

impl<V> Table<V> {
    fn cancel_timer(&mut self, key: &str) {
        if let Some(timer) = self.timers.remove(key) {
            timer.handle.abort();
        }
    }
}

/// A map + timer table guarded by a reader/writer lock.
pub struct MemoryStore<V> {
    table: Arc<RwLock<Table<V>>>,
    generation: AtomicU64,
    open: AtomicBool,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(Table {
                items: HashMap::new(),
                timers: HashMap::new(),
            })),
            generation: AtomicU64::new(0),
            open: AtomicBool::new(true),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.table.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> Result<(), KvsError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(KvsError::Closed)
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> Store<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn open(&self) -> Result<(), KvsError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<(), KvsError> {
        self.open.store(false, Ordering::Release);
        let mut table = self.table.write();
        for (_, timer) in table.timers.drain() {
            timer.handle.abort();
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<V, KvsError> {
        self.check_open()?;
        let table = self.table.read();
        table.items.get(key).cloned().ok_or(KvsError::NotFound)
    }

    async fn set(&self, key: &str, value: V) -> Result<(), KvsError> {
        self.check_open()?;
        let mut table = self.table.write();
        table.cancel_timer(key);
        table.items.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvsError> {
        self.check_open()?;
        let mut table = self.table.write();
        table.cancel_timer(key);
        table.items.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvsError> {
        self.check_open()?;
        let table = self.table.read();
        Ok(table.items.contains_key(key))
    }
}

#[async_trait]
impl<V> TtlStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> Result<(), KvsError> {
        self.check_open()?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        // The timer is spawned and recorded under the write lock, so it can
        // only observe the table after its own generation is in place.
        let mut table = self.table.write();
        table.cancel_timer(key);
        table.items.insert(key.to_string(), value);

        let weak = Arc::downgrade(&self.table);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(table) = weak.upgrade() else {
                return;
            };
            let mut table = table.write();
            let current = table.timers.get(&owned_key).map(|t| t.generation);
            if current == Some(generation) {
                table.timers.remove(&owned_key);
                table.items.remove(&owned_key);
                tracing::trace!(key = %owned_key, "Entry expired");
            }
        });
        table
            .timers
            .insert(key.to_string(), Timer { generation, handle });
        Ok(())
    }
}
