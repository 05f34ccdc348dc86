//! Turns discovery events into connection attempts.

use super::{DiscoveryError, DiscoveryStats, PeerFound, PeerQueue};
use async_trait::async_trait;
use fani_store::{BlockClient, NodeId, PeerInfo, PeerSet};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};

/// Establishes a connection to a discovered peer.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Connect to `peer` and register it for content exchange.
    async fn connect(&self, peer: &PeerFound) -> Result<PeerInfo, DiscoveryError>;
}

/// Connects by pinging the peer's block server and adding it to a [`PeerSet`].
pub struct BlockPeerConnector {
    node_id: NodeId,
    peers: PeerSet,
    timeout: Duration,
}

impl BlockPeerConnector {
    pub fn new(node_id: NodeId, peers: PeerSet, timeout: Duration) -> Self {
        Self {
            node_id,
            peers,
            timeout,
        }
    }
}

#[async_trait]
impl PeerConnector for BlockPeerConnector {
    async fn connect(&self, peer: &PeerFound) -> Result<PeerInfo, DiscoveryError> {
        let mut client = BlockClient::connect(peer.addr, self.timeout).await?;
        let pong = client.ping().await?;

        if pong.node_id == self.node_id {
            return Err(DiscoveryError::SelfConnection);
        }
        if let Some(announced) = peer.node_id {
            if announced != pong.node_id {
                return Err(DiscoveryError::IdentityMismatch {
                    announced,
                    actual: pong.node_id,
                });
            }
        }

        let info = PeerInfo {
            node_id: pong.node_id,
            addr: peer.addr,
        };
        self.peers.insert(info).await;
        Ok(info)
    }
}

/// Configuration for the [`DiscoveryDispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum connection attempts in flight.
    /// Default: 4
    pub max_concurrent_connects: usize,

    /// Time allowed for one connection attempt.
    /// Default: 5 seconds
    pub connect_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connects: 4,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Single consumer of the discovery queue.
///
/// Skips events naming this node, an already connected peer, or an
/// address with an attempt in flight. Every other event becomes a
/// connection attempt on its own task, bounded by a semaphore. Failures
/// are logged and counted, never propagated.
pub struct DiscoveryDispatcher {
    node_id: NodeId,
    queue: Arc<PeerQueue>,
    peers: PeerSet,
    connector: Arc<dyn PeerConnector>,
    config: DispatcherConfig,
    connect_semaphore: Arc<Semaphore>,
    pending: Arc<Mutex<HashSet<SocketAddr>>>,
    stats: Arc<DiscoveryStats>,
}

impl DiscoveryDispatcher {
    pub fn new(
        node_id: NodeId,
        queue: Arc<PeerQueue>,
        peers: PeerSet,
        connector: Arc<dyn PeerConnector>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            node_id,
            queue,
            peers,
            connector,
            connect_semaphore: Arc::new(Semaphore::new(config.max_concurrent_connects.max(1))),
            config,
            pending: Arc::new(Mutex::new(HashSet::new())),
            stats: Arc::new(DiscoveryStats::default()),
        }
    }

    /// Shared handle to the dispatcher's counters.
    pub fn stats(&self) -> Arc<DiscoveryStats> {
        Arc::clone(&self.stats)
    }

    /// Drain the queue until a shutdown signal arrives.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(
            max_concurrent_connects = self.config.max_concurrent_connects,
            "Discovery dispatcher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::debug!("Discovery dispatcher shutting down");
                    break;
                }

                event = self.queue.pop() => self.dispatch(event).await,
            }
        }
    }

    async fn dispatch(&self, event: PeerFound) {
        if event.node_id == Some(self.node_id) {
            self.skip(&event, "self announcement");
            return;
        }
        if let Some(node_id) = event.node_id {
            if self.peers.contains(&node_id).await {
                self.skip(&event, "already connected");
                return;
            }
        }
        if self.peers.contains_addr(&event.addr).await {
            self.skip(&event, "already connected");
            return;
        }
        if !self.pending.lock().await.insert(event.addr) {
            self.skip(&event, "attempt in flight");
            return;
        }

        let permit = match Arc::clone(&self.connect_semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.pending.lock().await.remove(&event.addr);
                return;
            }
        };

        let connector = Arc::clone(&self.connector);
        let pending = Arc::clone(&self.pending);
        let stats = Arc::clone(&self.stats);
        let limit = self.config.connect_timeout;

        tokio::spawn(async move {
            let _permit = permit;

            match tokio::time::timeout(limit, connector.connect(&event)).await {
                Ok(Ok(info)) => {
                    stats.connected.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(node_id = %info.node_id, addr = %info.addr, "Connected to peer");
                }
                Ok(Err(DiscoveryError::SelfConnection)) => {
                    stats.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(addr = %event.addr, "Address belongs to this node");
                }
                Ok(Err(e)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(addr = %event.addr, error = %e, "Failed to connect to peer");
                }
                Err(_) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(addr = %event.addr, timeout_ms = limit.as_millis() as u64, "Peer connection timed out");
                }
            }

            pending.lock().await.remove(&event.addr);
        });
    }

    fn skip(&self, event: &PeerFound, reason: &'static str) {
        self.stats.skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(addr = %event.addr, reason, "Ignoring discovered peer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fani_store::StoreError;

    /// Records attempts and fails for port 1.
    #[derive(Default)]
    struct ScriptedConnector {
        attempts: Mutex<Vec<SocketAddr>>,
    }

    #[async_trait]
    impl PeerConnector for ScriptedConnector {
        async fn connect(&self, peer: &PeerFound) -> Result<PeerInfo, DiscoveryError> {
            self.attempts.lock().await.push(peer.addr);
            if peer.addr.port() == 1 {
                return Err(StoreError::Connection("refused".into()).into());
            }
            Ok(PeerInfo {
                node_id: peer.node_id.unwrap_or_default(),
                addr: peer.addr,
            })
        }
    }

    fn found(node_id: Option<NodeId>, port: u16) -> PeerFound {
        PeerFound {
            node_id,
            addr: SocketAddr::from(([192, 168, 1, 20], port)),
        }
    }

    fn dispatcher(
        node_id: NodeId,
        peers: PeerSet,
        connector: Arc<ScriptedConnector>,
    ) -> DiscoveryDispatcher {
        DiscoveryDispatcher::new(
            node_id,
            Arc::new(PeerQueue::new(8)),
            peers,
            connector,
            DispatcherConfig::default(),
        )
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_concurrent_connects, 4);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_self() {
        let me = NodeId::new();
        let connector = Arc::new(ScriptedConnector::default());
        let d = dispatcher(me, PeerSet::new(), Arc::clone(&connector));

        d.dispatch(found(Some(me), 4000)).await;
        settle().await;

        assert!(connector.attempts.lock().await.is_empty());
        assert_eq!(d.stats().skipped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_connected_peer() {
        let peers = PeerSet::new();
        let known = NodeId::new();
        peers
            .insert(PeerInfo {
                node_id: known,
                addr: found(None, 4000).addr,
            })
            .await;
        let connector = Arc::new(ScriptedConnector::default());
        let d = dispatcher(NodeId::new(), peers, Arc::clone(&connector));

        d.dispatch(found(Some(known), 4000)).await;
        d.dispatch(found(None, 4000)).await;
        settle().await;

        assert!(connector.attempts.lock().await.is_empty());
        assert_eq!(d.stats().skipped(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_block_later_peers() {
        let connector = Arc::new(ScriptedConnector::default());
        let d = dispatcher(NodeId::new(), PeerSet::new(), Arc::clone(&connector));

        d.dispatch(found(Some(NodeId::new()), 1)).await;
        d.dispatch(found(Some(NodeId::new()), 4000)).await;
        settle().await;

        assert_eq!(connector.attempts.lock().await.len(), 2);
        assert_eq!(d.stats().failed(), 1);
        assert_eq!(d.stats().connected(), 1);
        assert!(d.pending.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue_until_shutdown() {
        let connector = Arc::new(ScriptedConnector::default());
        let queue = Arc::new(PeerQueue::new(8));
        let d = DiscoveryDispatcher::new(
            NodeId::new(),
            Arc::clone(&queue),
            PeerSet::new(),
            connector.clone(),
            DispatcherConfig::default(),
        );
        let stats = d.stats();
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(d.run(rx));

        queue.push(found(Some(NodeId::new()), 4001)).await;
        queue.push(found(Some(NodeId::new()), 4002)).await;
        settle().await;
        assert_eq!(stats.connected(), 2);

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
