//! Block exchange between two in-process nodes over localhost TCP.

use async_trait::async_trait;
use bytes::Bytes;
use fani_store::{
    BlockClient, BlockServer, ContentAddress, ContentStore, FsStore, MemoryStore, NetworkStore,
    NodeId, PeerInfo, PeerSet, RetryPolicy, StoreError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a block server over `store`, returning its endpoint and node id.
async fn serve(
    store: Arc<dyn ContentStore>,
    shutdown: &broadcast::Sender<()>,
) -> (SocketAddr, NodeId) {
    let node_id = NodeId::new();
    let server = BlockServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), store, node_id)
        .await
        .expect("bind block server");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run(shutdown.subscribe()));
    (addr, node_id)
}

/// A store that answers every request with the same bytes.
struct LyingStore;

#[async_trait]
impl ContentStore for LyingStore {
    async fn put(&self, data: Bytes) -> fani_store::Result<ContentAddress> {
        Ok(ContentAddress::of(&data))
    }

    async fn get(&self, _address: &ContentAddress) -> fani_store::Result<Bytes> {
        Ok(Bytes::from_static(b"not what you asked for"))
    }

    async fn has(&self, _address: &ContentAddress) -> fani_store::Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn test_ping_returns_node_id() {
    let (shutdown, _) = broadcast::channel(1);
    let (addr, node_id) = serve(Arc::new(MemoryStore::new()), &shutdown).await;

    let mut client = BlockClient::connect(addr, TIMEOUT).await.unwrap();
    let pong = client.ping().await.unwrap();
    assert!(pong.pong);
    assert_eq!(pong.node_id, node_id);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_client_get_and_has_block() {
    let (shutdown, _) = broadcast::channel(1);
    let remote = Arc::new(MemoryStore::new());
    let address = remote.put(Bytes::from_static(b"remote block")).await.unwrap();
    let (addr, _) = serve(remote, &shutdown).await;

    let mut client = BlockClient::connect(addr, TIMEOUT).await.unwrap();
    assert!(client.has_block(&address).await.unwrap());
    assert_eq!(
        client.get_block(&address).await.unwrap(),
        Bytes::from_static(b"remote block")
    );

    let missing = ContentAddress::of(b"missing");
    assert!(!client.has_block(&missing).await.unwrap());
    assert!(matches!(
        client.get_block(&missing).await,
        Err(StoreError::NotFound(_))
    ));

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_network_store_fetches_from_peer_and_keeps_copy() {
    let (shutdown, _) = broadcast::channel(1);
    let remote = Arc::new(MemoryStore::new());
    let address = remote.put(Bytes::from_static(b"shared")).await.unwrap();
    let (addr, node_id) = serve(remote, &shutdown).await;

    let peers = PeerSet::new();
    peers.insert(PeerInfo { node_id, addr }).await;
    let local = Arc::new(MemoryStore::new());
    let store = NetworkStore::new(local.clone(), peers).with_retry(RetryPolicy::none());

    assert_eq!(
        store.get(&address).await.unwrap(),
        Bytes::from_static(b"shared")
    );
    assert!(local.has(&address).await.unwrap());

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_network_store_rejects_mismatching_peer_content() {
    let (shutdown, _) = broadcast::channel(1);
    let (addr, node_id) = serve(Arc::new(LyingStore), &shutdown).await;

    let peers = PeerSet::new();
    peers.insert(PeerInfo { node_id, addr }).await;
    let local = Arc::new(MemoryStore::new());
    let store = NetworkStore::new(local.clone(), peers).with_retry(RetryPolicy::none());

    let address = ContentAddress::of(b"the real content");
    let result = store.get(&address).await;
    assert!(matches!(result, Err(StoreError::Unavailable { .. })));
    assert!(local.is_empty().await);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_unreachable_peer_is_dropped() {
    // Bind and immediately release a port so nothing listens on it
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let peers = PeerSet::new();
    let node_id = NodeId::new();
    peers.insert(PeerInfo { node_id, addr }).await;

    let store = NetworkStore::new(Arc::new(MemoryStore::new()), peers.clone())
        .with_retry(RetryPolicy::none())
        .with_request_timeout(Duration::from_secs(1));

    let result = store.get(&ContentAddress::of(b"anything")).await;
    assert!(result.is_err());
    assert!(!peers.contains(&node_id).await);
}

#[tokio::test]
async fn test_network_store_repairs_corrupt_local_block() {
    let (shutdown, _) = broadcast::channel(1);
    let remote = Arc::new(MemoryStore::new());
    let address = remote.put(Bytes::from_static(b"content")).await.unwrap();
    let (addr, node_id) = serve(remote, &shutdown).await;

    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(FsStore::open(dir.path()).await.unwrap());
    local.put(Bytes::from_static(b"content")).await.unwrap();
    std::fs::write(local.blocks_dir().join(address.to_string()), b"rot").unwrap();

    let peers = PeerSet::new();
    peers.insert(PeerInfo { node_id, addr }).await;
    let store = NetworkStore::new(local.clone(), peers).with_retry(RetryPolicy::none());

    assert_eq!(
        store.get(&address).await.unwrap(),
        Bytes::from_static(b"content")
    );
    // The local copy was rewritten from the peer
    assert_eq!(
        local.get(&address).await.unwrap(),
        Bytes::from_static(b"content")
    );

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let (shutdown, _) = broadcast::channel(1);
    let (addr, _) = serve(Arc::new(MemoryStore::new()), &shutdown).await;

    let mut client = BlockClient::connect(addr, TIMEOUT).await.unwrap();
    client.ping().await.unwrap();

    let _ = shutdown.send(());

    tokio::time::timeout(TIMEOUT, async {
        while client.ping().await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection stayed open after shutdown");
}
