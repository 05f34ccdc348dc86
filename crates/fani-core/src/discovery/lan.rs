//! Local network discovery over UDP broadcast.
//!
//! Every node periodically broadcasts a small JSON announcement
//! `{"service":"fani","node_id":"...","port":N}` to the discovery port and
//! listens on the same port. A received announcement yields a peer at the
//! datagram's source IP and the announced block-server port.

use super::{DiscoveryError, PeerDiscovery, PeerFound, PeerQueue};
use async_trait::async_trait;
use fani_store::NodeId;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

/// Service tag carried by every announcement.
pub const SERVICE_NAME: &str = "fani";

/// Largest announcement datagram read.
const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    service: String,
    node_id: NodeId,
    port: u16,
}

/// Configuration for [`LanDiscovery`].
#[derive(Debug, Clone)]
pub struct LanConfig {
    /// UDP port for announcements (default: 4690).
    pub port: u16,
    /// Time between announcements (default: 5s).
    pub announce_interval: Duration,
    /// Destination of announcements (default: 255.255.255.255).
    pub broadcast_addr: Ipv4Addr,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            port: 4690,
            announce_interval: Duration::from_secs(5),
            broadcast_addr: Ipv4Addr::BROADCAST,
        }
    }
}

/// Announces this node and listens for others on the local segment.
pub struct LanDiscovery {
    node_id: NodeId,
    /// Port of this node's block server.
    service_port: u16,
    config: LanConfig,
}

impl LanDiscovery {
    pub fn new(node_id: NodeId, service_port: u16, config: LanConfig) -> Self {
        Self {
            node_id,
            service_port,
            config,
        }
    }

    fn announcement(&self) -> Result<Vec<u8>, DiscoveryError> {
        let announcement = Announcement {
            service: SERVICE_NAME.to_string(),
            node_id: self.node_id,
            port: self.service_port,
        };
        serde_json::to_vec(&announcement)
            .map_err(|e| DiscoveryError::Io(std::io::Error::other(e)))
    }

    /// Interpret a datagram received from `from`.
    fn parse(&self, datagram: &[u8], from: SocketAddr) -> Option<PeerFound> {
        let announcement: Announcement = match serde_json::from_slice(datagram) {
            Ok(a) => a,
            Err(e) => {
                tracing::trace!(from = %from, error = %e, "Ignoring malformed announcement");
                return None;
            }
        };
        if announcement.service != SERVICE_NAME || announcement.node_id == self.node_id {
            return None;
        }
        Some(PeerFound {
            node_id: Some(announcement.node_id),
            addr: SocketAddr::new(from.ip(), announcement.port),
        })
    }
}

/// Bind a broadcast-capable UDP socket that other local nodes can share.
fn bind_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

#[async_trait]
impl PeerDiscovery for LanDiscovery {
    fn name(&self) -> &'static str {
        "lan"
    }

    async fn run(
        &self,
        queue: Arc<PeerQueue>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), DiscoveryError> {
        let socket = bind_socket(self.config.port).map_err(DiscoveryError::Bind)?;
        let announcement = self.announcement()?;
        let target = SocketAddr::from((self.config.broadcast_addr, self.config.port));
        let mut ticker = tokio::time::interval(self.config.announce_interval);
        let mut buf = [0u8; MAX_DATAGRAM];

        tracing::info!(
            port = self.config.port,
            node_id = %self.node_id,
            service_port = self.service_port,
            "LAN discovery started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::debug!("LAN discovery shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = socket.send_to(&announcement, target).await {
                        tracing::warn!(dest = %target, error = %e, "Failed to send announcement");
                    }
                }

                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if let Some(found) = self.parse(&buf[..len], from) {
                            tracing::debug!(node_id = ?found.node_id, addr = %found.addr, "Discovered peer");
                            queue.push(found).await;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to receive announcement"),
                },
            }
        }

        Ok(())
    }
}
