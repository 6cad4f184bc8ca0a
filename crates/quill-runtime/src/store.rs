//! Key-value store contract used by the run recorder.
//!
//! The contract is plain get/set. Stores that can compare-and-set
//! atomically override [`KvStore::compare_and_set`]; the default is a
//! best-effort read-check-write.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Key-value store failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Value for '{0}' changed since it was read")]
    Conflict(String),

    #[error("Store call timed out")]
    Timeout,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Write `value` only if the stored bytes still equal `expected`
    /// (`None` meaning absent).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        let current = self.get(key).await?;
        if current.as_deref() != expected {
            return Err(StoreError::Conflict(key.to_string()));
        }
        self.set(key, value).await
    }
}

/// In-process store with atomic compare-and-set.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_online()?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check_online()?;
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write();
        if entries.get(key).map(Vec::as_slice) != expected {
            return Err(StoreError::Conflict(key.to_string()));
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }
}
