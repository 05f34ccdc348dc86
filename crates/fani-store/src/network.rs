//! Network-backed content store.

use crate::address::ContentAddress;
use crate::client::BlockClient;
use crate::error::{Result, StoreError};
use crate::peers::PeerSet;
use crate::retry::{unavailable, RetryPolicy};
use crate::store::ContentStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Default timeout for a single peer request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A content store that falls back to connected peers on a local miss.
///
/// `put` only writes locally; the node's block server then provides the
/// block to anyone who asks. `get` answers from the local store when it
/// can, otherwise asks each connected peer in turn, verifies what comes
/// back, and keeps a local copy.
pub struct NetworkStore {
    local: Arc<dyn ContentStore>,
    peers: PeerSet,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl NetworkStore {
    /// Create a network store over `local` using the given peer set.
    pub fn new(local: Arc<dyn ContentStore>, peers: PeerSet) -> Self {
        Self {
            local,
            peers,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the retry policy for peer fetches.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the timeout for a single peer request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The local store backing this network store.
    pub fn local(&self) -> &Arc<dyn ContentStore> {
        &self.local
    }

    /// The peer set consulted on a local miss.
    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// One sweep over all connected peers.
    async fn fetch_from_peers(&self, address: &ContentAddress) -> Result<Bytes> {
        let peers = self.peers.list().await;
        if peers.is_empty() {
            return Err(unavailable(*address, "no connected peers"));
        }

        let mut last_error = None;
        for peer in peers {
            let result = async {
                let mut client = BlockClient::connect(peer.addr, self.request_timeout).await?;
                client.get_block(address).await
            }
            .await;

            match result {
                Ok(data) => {
                    tracing::debug!(address = %address, node_id = %peer.node_id, "Fetched block from peer");
                    return Ok(data);
                }
                Err(StoreError::NotFound(_)) => {
                    tracing::trace!(address = %address, node_id = %peer.node_id, "Peer does not have block");
                    last_error = Some(StoreError::NotFound(*address));
                }
                Err(e @ StoreError::IntegrityMismatch { .. }) => {
                    tracing::warn!(address = %address, node_id = %peer.node_id, error = %e, "Peer sent mismatching content");
                    last_error = Some(unavailable(
                        *address,
                        format!("peer {} sent mismatching content", peer.node_id),
                    ));
                }
                Err(e @ (StoreError::Connection(_) | StoreError::Timeout(_))) => {
                    tracing::warn!(node_id = %peer.node_id, addr = %peer.addr, error = %e, "Peer unreachable, dropping");
                    self.peers.remove(&peer.node_id).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(address = %address, node_id = %peer.node_id, error = %e, "Peer fetch failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| unavailable(*address, "no peer has the block")))
    }
}

#[async_trait]
impl ContentStore for NetworkStore {
    async fn put(&self, data: Bytes) -> Result<ContentAddress> {
        self.local.put(data).await
    }

    async fn get(&self, address: &ContentAddress) -> Result<Bytes> {
        match self.local.get(address).await {
            Ok(data) => return Ok(data),
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(address = %address, "Block not stored locally, asking peers");
            }
            // The peer copy replaces the corrupt one below
            Err(e @ StoreError::IntegrityMismatch { .. }) => {
                tracing::warn!(address = %address, error = %e, "Local block is corrupt, asking peers");
            }
            Err(e) => return Err(e),
        }

        let data = self
            .retry
            .run("fetch block", || self.fetch_from_peers(address))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => unavailable(*address, "no peer has the block"),
                other => other,
            })?;

        // Keep a copy so this node can provide the block too
        let stored = self.local.put(data.clone()).await?;
        if stored != *address {
            return Err(StoreError::IntegrityMismatch {
                expected: *address,
                actual: stored,
            });
        }
        Ok(data)
    }

    async fn has(&self, address: &ContentAddress) -> Result<bool> {
        self.local.has(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn no_retry_store(local: Arc<dyn ContentStore>) -> NetworkStore {
        NetworkStore::new(local, PeerSet::new()).with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_local_hit() {
        let local: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let address = local.put(Bytes::from_static(b"local")).await.unwrap();
        let store = no_retry_store(local);
        assert_eq!(
            store.get(&address).await.unwrap(),
            Bytes::from_static(b"local")
        );
    }

    #[tokio::test]
    async fn test_put_writes_locally() {
        let local: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let store = no_retry_store(Arc::clone(&local));
        let address = store.put(Bytes::from_static(b"mine")).await.unwrap();
        assert!(local.has(&address).await.unwrap());
    }

    #[tokio::test]
    async fn test_miss_without_peers_is_unavailable() {
        let store = no_retry_store(Arc::new(MemoryStore::new()));
        let result = store.get(&ContentAddress::of(b"nowhere")).await;
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
    }
}
