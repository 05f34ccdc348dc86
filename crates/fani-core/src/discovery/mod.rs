//! Peer discovery.
//!
//! Discovery sources ([`LanDiscovery`], [`BootstrapDiscovery`]) push
//! [`PeerFound`] events onto a bounded [`PeerQueue`]. A single
//! [`DiscoveryDispatcher`] drains the queue and turns events into
//! connection attempts, so a slow or dead peer never holds up discovery of
//! the next one.
//!
//! ```text
//!  LanDiscovery ──┐
//!                 ├──▶ PeerQueue (drop-oldest) ──▶ DiscoveryDispatcher ──▶ PeerConnector
//!  Bootstrap ─────┘                                  (skip self/known,       (ping, register
//!                                                     bounded attempts)        in PeerSet)
//! ```

mod dispatcher;
mod lan;
mod queue;

pub use dispatcher::{BlockPeerConnector, DiscoveryDispatcher, DispatcherConfig, PeerConnector};
pub use lan::{LanConfig, LanDiscovery, SERVICE_NAME};
pub use queue::PeerQueue;

use async_trait::async_trait;
use fani_store::NodeId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors raised by discovery sources and connection attempts.
///
/// None of these are fatal to the node; they are logged and discovery
/// carries on.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Could not set up the discovery socket
    #[error("failed to bind discovery socket: {0}")]
    Bind(std::io::Error),

    /// Could not reach the peer's block server
    #[error("connection failed: {0}")]
    Connect(#[from] fani_store::StoreError),

    /// The address turned out to be this node
    #[error("peer is this node")]
    SelfConnection,

    /// The peer answered with another identity than it announced
    #[error("peer identity mismatch: announced {announced}, answered {actual}")]
    IdentityMismatch { announced: NodeId, actual: NodeId },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A peer announced by a discovery source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFound {
    /// Announced identity; bootstrap addresses have none.
    pub node_id: Option<NodeId>,
    /// Block-exchange endpoint.
    pub addr: SocketAddr,
}

/// A source of [`PeerFound`] events.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Announce this node and push discovered peers onto `queue` until a
    /// shutdown signal arrives or the source is exhausted.
    async fn run(
        &self,
        queue: Arc<PeerQueue>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), DiscoveryError>;
}

/// Discovery statistics for observability.
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    /// Peers successfully connected.
    pub connected: AtomicU64,
    /// Connection attempts that failed or timed out.
    pub failed: AtomicU64,
    /// Events ignored because they named this node or a known peer.
    pub skipped: AtomicU64,
}

impl DiscoveryStats {
    pub fn connected(&self) -> u64 {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Feeds a fixed list of peer addresses once.
#[derive(Debug, Clone, Default)]
pub struct BootstrapDiscovery {
    peers: Vec<SocketAddr>,
}

impl BootstrapDiscovery {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl PeerDiscovery for BootstrapDiscovery {
    fn name(&self) -> &'static str {
        "bootstrap"
    }

    async fn run(
        &self,
        queue: Arc<PeerQueue>,
        _shutdown: broadcast::Receiver<()>,
    ) -> Result<(), DiscoveryError> {
        for addr in &self.peers {
            tracing::debug!(addr = %addr, "Queueing bootstrap peer");
            queue
                .push(PeerFound {
                    node_id: None,
                    addr: *addr,
                })
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_queues_every_peer() {
        let peers: Vec<SocketAddr> = vec![
            "10.0.0.1:4001".parse().unwrap(),
            "10.0.0.2:4001".parse().unwrap(),
        ];
        let queue = Arc::new(PeerQueue::new(8));
        let (_tx, rx) = broadcast::channel(1);

        BootstrapDiscovery::new(peers.clone())
            .run(Arc::clone(&queue), rx)
            .await
            .unwrap();

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.pop().await.addr, peers[0]);
        assert_eq!(queue.pop().await.node_id, None);
    }
}
