//! Node identity and the set of connected peers.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Unique identifier of a node on the network.
///
/// Generated once at startup. Peers use it to recognise their own
/// announcements and to de-duplicate connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for NodeId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StoreError::Protocol(format!("invalid node id {s}: {e}")))
    }
}

/// A peer's identity and block-exchange endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's node ID.
    pub node_id: NodeId,
    /// Address of the peer's block server.
    pub addr: SocketAddr,
}

/// Peers this node is connected to.
///
/// Cheap to clone; all clones share the same registry. Discovery adds
/// peers, the network store reads them and drops peers that stop answering.
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    peers: Arc<RwLock<HashMap<NodeId, PeerInfo>>>,
}

impl PeerSet {
    /// Create an empty peer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Returns `false` if it was already present.
    pub async fn insert(&self, peer: PeerInfo) -> bool {
        let mut peers = self.peers.write().await;
        let added = peers.insert(peer.node_id, peer).is_none();
        if added {
            tracing::info!(node_id = %peer.node_id, addr = %peer.addr, total = peers.len(), "Peer connected");
        }
        added
    }

    /// Remove a peer. Returns the removed entry, if any.
    pub async fn remove(&self, node_id: &NodeId) -> Option<PeerInfo> {
        let removed = self.peers.write().await.remove(node_id);
        if let Some(peer) = &removed {
            tracing::info!(node_id = %peer.node_id, addr = %peer.addr, "Peer disconnected");
        }
        removed
    }

    /// Check if a peer with this node ID is connected.
    pub async fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.read().await.contains_key(node_id)
    }

    /// Check if any connected peer uses this endpoint.
    pub async fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.peers.read().await.values().any(|p| p.addr == *addr)
    }

    /// Snapshot of all connected peers.
    pub async fn list(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().copied().collect()
    }

    /// Number of connected peers.
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Check if no peer is connected.
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
