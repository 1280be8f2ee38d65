use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::content::ContentStore;
use crate::error::{Result, StoreError};

/// In-process content-addressable store keyed by the BLAKE3 hex digest of
/// the stored bytes.
///
/// Cloning is not supported; share it behind an `Arc` so several bucket
/// stores see the same content, the way peers share one backend.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `put` calls that reached the store, successful or not.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    /// Overwrite the bytes behind `hash`, for corruption tests.
    pub fn corrupt(&self, hash: &str, data: Vec<u8>) {
        self.blobs.lock().insert(hash.to_string(), data);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: &[u8]) -> Result<String> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let hash = blake3::hash(data).to_hex().to_string();
        self.blobs.lock().insert(hash.clone(), data.to_vec());
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        self.check_online()?;
        self.blobs
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(hash.to_string()))
    }

    async fn unpin(&self, hash: &str) -> Result<()> {
        self.check_online()?;
        self.blobs.lock().remove(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_is_content_addressed() {
        let store = MemoryContentStore::new();
        let a = store.put(b"same").await.unwrap();
        let b = store.put(b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).await.unwrap(), b"same");
    }

    #[tokio::test]
    async fn test_missing_hash_not_found() {
        let store = MemoryContentStore::new();
        assert!(matches!(
            store.get("deadbeef").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_is_retryable() {
        let store = MemoryContentStore::new();
        store.set_offline(true);
        let err = store.put(b"x").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.put_count(), 1);
    }
}
