//! Node startup and shutdown.
//!
//! [`Node::start`] wires the pieces together in order: identity, local
//! store, block server, discovery (bootstrap peers and LAN), bytecode
//! cache, sandbox, and finally the [`NodeContext`] handed to the
//! [`Orchestrator`]. Background tasks run until [`Node::shutdown`].

use crate::cache::BytecodeCache;
use crate::config::{ConfigError, NodeConfig};
use crate::context::NodeContext;
use crate::discovery::{
    BlockPeerConnector, BootstrapDiscovery, DiscoveryDispatcher, DispatcherConfig, LanDiscovery,
    PeerDiscovery, PeerQueue,
};
use crate::error::CoreError;
use crate::orchestrator::Orchestrator;
use crate::sandbox::ProcessSandbox;
use fani_store::{
    BlockServer, ContentStore, FsStore, MemoryStore, NetworkStore, NodeId, PeerSet, StoreError,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Time allowed for background tasks to stop after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that prevent a node from starting.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// A running fani node.
pub struct Node {
    orchestrator: Orchestrator,
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start a node from `config`.
    ///
    /// Bootstrap and discovery failures are logged, never fatal.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let node_id = NodeId::new();
        let local: Arc<dyn ContentStore> = if config.ephemeral {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(FsStore::open(&config.home).await?)
        };
        let peers = PeerSet::new();
        let store: Arc<dyn ContentStore> =
            Arc::new(NetworkStore::new(Arc::clone(&local), peers.clone()));

        let (shutdown, _) = broadcast::channel::<()>(1);
        let mut tasks = Vec::new();

        // Serve only the local store so peer requests never fan out
        let server = BlockServer::bind(config.listen, local, node_id).await?;
        let local_addr = server.local_addr()?;
        tasks.push(tokio::spawn(server.run(shutdown.subscribe())));

        let queue = Arc::new(PeerQueue::new(config.discovery_queue));
        let dispatcher_config = DispatcherConfig::default();
        let connector = Arc::new(BlockPeerConnector::new(
            node_id,
            peers.clone(),
            dispatcher_config.connect_timeout,
        ));
        let dispatcher = DiscoveryDispatcher::new(
            node_id,
            Arc::clone(&queue),
            peers.clone(),
            connector,
            dispatcher_config,
        );
        let discovery_stats = dispatcher.stats();
        tasks.push(tokio::spawn(dispatcher.run(shutdown.subscribe())));

        let bootstrap = resolve_bootstrap(&config.bootstrap).await;
        if !bootstrap.is_empty() {
            tasks.push(spawn_discovery(
                BootstrapDiscovery::new(bootstrap),
                Arc::clone(&queue),
                &shutdown,
            ));
        }
        if config.discovery_enabled {
            tasks.push(spawn_discovery(
                LanDiscovery::new(node_id, local_addr.port(), config.lan_config()),
                Arc::clone(&queue),
                &shutdown,
            ));
        }

        let cache = Arc::new(BytecodeCache::open(&config.cache_dir, Arc::clone(&store)).await?);
        let sandbox = Arc::new(ProcessSandbox::new(config.sandbox_config()));

        let ctx = NodeContext::builder(store, cache, sandbox)
            .node_id(node_id)
            .peers(peers)
            .discovery(discovery_stats)
            .timeouts(config.stage_timeouts())
            .input_assembly(config.input_assembly)
            .build();

        tracing::info!(
            node_id = %node_id,
            addr = %local_addr,
            ephemeral = config.ephemeral,
            discovery = config.discovery_enabled,
            "Node started"
        );

        Ok(Self {
            orchestrator: Orchestrator::new(Arc::new(ctx)),
            local_addr,
            shutdown,
            tasks,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.orchestrator.context().node_id()
    }

    /// Address of the block server.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        self.orchestrator.context()
    }

    /// Keep serving until `signal` completes, then shut down.
    pub async fn serve_until(self, signal: impl Future<Output = ()>) {
        tracing::info!(addr = %self.local_addr, "Serving content until shutdown");
        signal.await;
        self.shutdown().await;
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down node");
        let _ = self.shutdown.send(());

        for task in self.tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Background task failed"),
                Err(_) => tracing::warn!("Background task did not stop in time"),
            }
        }

        tracing::info!("Node shutdown complete");
    }
}

/// Run a discovery source on its own task, logging a failure.
fn spawn_discovery(
    source: impl PeerDiscovery + 'static,
    queue: Arc<PeerQueue>,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        if let Err(e) = source.run(queue, rx).await {
            tracing::warn!(source = source.name(), error = %e, "Discovery source stopped");
        }
    })
}

/// Resolve `host:port` strings, skipping any that fail.
async fn resolve_bootstrap(peers: &[String]) -> Vec<SocketAddr> {
    let mut resolved = Vec::with_capacity(peers.len());
    for peer in peers {
        match tokio::net::lookup_host(peer.as_str()).await {
            Ok(addrs) => resolved.extend(addrs.take(1)),
            Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to resolve bootstrap peer"),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> NodeConfig {
        NodeConfig {
            home: dir.path().join("home"),
            cache_dir: dir.path().join("cache"),
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            discovery_enabled: false,
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::start(test_config(&dir)).await.unwrap();

        assert_ne!(node.local_addr().port(), 0);
        assert!(dir.path().join("home").join("blocks").is_dir());
        assert!(dir.path().join("cache").is_dir());
        assert!(node.context().discovery().is_some());

        tokio::time::timeout(Duration::from_secs(10), node.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            discovery_queue: 0,
            ..test_config(&dir)
        };
        assert!(matches!(
            Node::start(config).await,
            Err(NodeError::Config(ConfigError::ZeroQueue))
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_bootstrap_is_skipped() {
        let resolved = resolve_bootstrap(&[
            "127.0.0.1:4001".to_string(),
            "definitely-not-a-host.invalid:4001".to_string(),
        ])
        .await;
        assert_eq!(resolved, vec![SocketAddr::from(([127, 0, 0, 1], 4001))]);
    }

    #[tokio::test]
    async fn test_bootstrap_connects_nodes() {
        let dir_a = tempfile::tempdir().unwrap();
        let a = Node::start(test_config(&dir_a)).await.unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        let b = Node::start(NodeConfig {
            bootstrap: vec![a.local_addr().to_string()],
            ..test_config(&dir_b)
        })
        .await
        .unwrap();

        let a_id = a.node_id();
        let connected = tokio::time::timeout(Duration::from_secs(5), async {
            while !b.context().peers().contains(&a_id).await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(connected.is_ok());

        b.shutdown().await;
        a.shutdown().await;
    }
}
