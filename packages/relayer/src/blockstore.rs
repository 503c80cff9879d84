//! Per-chain block checkpoints
//!
//! A checkpoint is the last block whose deposits were all handed to the
//! router. Keys are `b"chain:" ++ domain_id`, values are 8-byte big-endian
//! heights. The backing [`KeyValueStore`] is either [`MemoryStore`] or the
//! Postgres store in [`crate::db`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::types::DomainId;

const KEY_PREFIX: &[u8] = b"chain:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("checkpoint for domain {domain_id} is {len} bytes, expected 8")]
    Corrupt { domain_id: DomainId, len: usize },

    #[error("checkpoint for domain {domain_id} would move back from {stored} to {attempted}")]
    Regression {
        domain_id: DomainId,
        stored: u64,
        attempted: u64,
    },

    #[error("store is closed")]
    Closed,
}

/// Minimal durable key/value capability
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write one value. Either the whole value lands or nothing does.
    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Process-local store, used when no database is configured
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn checkpoint_key(domain_id: DomainId) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX.len() + 1);
    key.extend_from_slice(KEY_PREFIX);
    key.push(domain_id);
    key
}

/// Monotonic checkpoint store shared by all listeners
///
/// Each listener only touches its own domain's key.
#[derive(Clone)]
pub struct BlockStore {
    kv: Arc<dyn KeyValueStore>,
}

impl BlockStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Last processed block for `domain_id`, 0 if none was ever stored
    pub async fn get(&self, domain_id: DomainId) -> Result<u64, StoreError> {
        match self.kv.get(&checkpoint_key(domain_id)).await? {
            None => Ok(0),
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| StoreError::Corrupt {
                    domain_id,
                    len: raw.len(),
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
        }
    }

    /// Record `block` as processed. Rewriting the current value is allowed,
    /// moving backwards is not.
    pub async fn put(&self, domain_id: DomainId, block: u64) -> Result<(), StoreError> {
        let stored = self.get(domain_id).await?;
        if block < stored {
            return Err(StoreError::Regression {
                domain_id,
                stored,
                attempted: block,
            });
        }

        self.kv
            .set(&checkpoint_key(domain_id), &block.to_be_bytes())
            .await?;
        debug!(domain_id, block, "Checkpoint stored");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.kv.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_absent_checkpoint_is_zero() {
        let store = BlockStore::in_memory();
        assert_eq!(store.get(4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = BlockStore::in_memory();
        store.put(1, 95).await.unwrap();
        assert_eq!(store.get(1).await.unwrap(), 95);
        assert_eq!(store.get(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_never_decreases() {
        let store = BlockStore::in_memory();
        store.put(1, 95).await.unwrap();
        store.put(1, 95).await.unwrap();

        let err = store.put(1, 80).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Regression {
                domain_id: 1,
                stored: 95,
                attempted: 80
            }
        );
        assert_eq!(store.get(1).await.unwrap(), 95);
    }

    #[tokio::test]
    async fn test_key_and_value_layout() {
        let kv = Arc::new(MemoryStore::new());
        let store = BlockStore::new(kv.clone());
        store.put(7, 0x0102).await.unwrap();

        let raw = kv.get(b"chain:\x07").await.unwrap().unwrap();
        assert_eq!(raw, vec![0, 0, 0, 0, 0, 0, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_corrupt_value() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(b"chain:\x03", &[1, 2, 3]).await.unwrap();

        let err = BlockStore::new(kv).get(3).await.unwrap_err();
        assert_eq!(err, StoreError::Corrupt { domain_id: 3, len: 3 });
    }

    #[tokio::test]
    async fn test_closed_store_rejects_access() {
        let store = BlockStore::in_memory();
        store.close().await.unwrap();
        assert_eq!(store.get(1).await.unwrap_err(), StoreError::Closed);
        assert_eq!(store.put(1, 5).await.unwrap_err(), StoreError::Closed);
    }
}
