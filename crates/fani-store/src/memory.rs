//! In-memory content store.

use crate::address::ContentAddress;
use crate::error::{Result, StoreError};
use crate::store::ContentStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A content store that keeps every blob in process memory.
///
/// Used for ephemeral nodes and in tests. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: RwLock<HashMap<ContentAddress, Bytes>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    /// Check if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, data: Bytes) -> Result<ContentAddress> {
        let address = ContentAddress::of(&data);
        let mut blocks = self.blocks.write().await;
        blocks.entry(address).or_insert(data);
        tracing::trace!(address = %address, "Stored block in memory");
        Ok(address)
    }

    async fn get(&self, address: &ContentAddress) -> Result<Bytes> {
        self.blocks
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or(StoreError::NotFound(*address))
    }

    async fn has(&self, address: &ContentAddress) -> Result<bool> {
        Ok(self.blocks.read().await.contains_key(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = MemoryStore::new();
        let data = Bytes::from_static(b"some content");
        let address = store.put(data.clone()).await.unwrap();
        assert_eq!(store.get(&address).await.unwrap(), data);
        assert!(store.has(&address).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.put(Bytes::from_static(b"same")).await.unwrap();
        let b = store.put(Bytes::from_static(b"same")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_blob() {
        let store = MemoryStore::new();
        let address = store.put(Bytes::new()).await.unwrap();
        assert!(store.get(&address).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryStore::new();
        let result = store.get(&ContentAddress::of(b"missing")).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
