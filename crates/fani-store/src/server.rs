//! Block exchange server.
//!
//! Serves blocks from a local store to peers. Each connection carries
//! newline-delimited JSON-RPC requests; supported methods:
//! - `ping` - Health check, returns `{pong: true, node_id}`.
//! - `has_block` - Whether a block is stored locally.
//! - `get_block` - Hex-encoded block contents.

use crate::address::ContentAddress;
use crate::error::StoreError;
use crate::peers::NodeId;
use crate::protocol::{
    error_codes, BlockParams, GetBlockResult, HasBlockResult, PingResult, Request, Response,
    MAX_BLOCK_SIZE,
};
use crate::store::ContentStore;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

/// Largest request line accepted from a peer.
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Serves locally stored blocks to peers.
///
/// The server only answers from the store it was given. Pass the node's
/// local store, not a network-backed one, so a request never fans out
/// into further peer requests.
pub struct BlockServer {
    listener: TcpListener,
    store: Arc<dyn ContentStore>,
    node_id: NodeId,
}

impl BlockServer {
    /// Bind the server to `addr`. Port 0 picks a free port.
    pub async fn bind(
        addr: SocketAddr,
        store: Arc<dyn ContentStore>,
        node_id: NodeId,
    ) -> Result<Self, StoreError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StoreError::Connection(format!("failed to bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            store,
            node_id,
        })
    }

    /// Address the server is actually listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, StoreError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until a shutdown signal arrives.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let addr = self.listener.local_addr().ok();
        info!(addr = ?addr, node_id = %self.node_id, "Block server listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Block server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        let store = Arc::clone(&self.store);
                        let node_id = self.node_id;
                        let conn_shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, store, node_id, conn_shutdown).await {
                                warn!(peer = %peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

/// Handle a single peer connection.
///
/// Reads newline-delimited JSON-RPC requests and writes responses until
/// the peer disconnects or the server shuts down.
async fn handle_connection(
    stream: TcpStream,
    store: Arc<dyn ContentStore>,
    node_id: NodeId,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), StoreError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_REQUEST_BYTES);
        let bytes_read = tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!("Closing connection on shutdown");
                break;
            }
            read = limited.read_line(&mut line) => read?,
        };

        if bytes_read == 0 {
            debug!("Peer disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        trace!(request = %trimmed, "Received request");

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => handle_request(req, store.as_ref(), node_id).await,
            Err(e) => {
                warn!(error = %e, "Failed to parse request");
                Response::error(0, error_codes::PARSE_ERROR, format!("parse error: {e}"))
            }
        };

        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Route a request to its handler.
pub(crate) async fn handle_request(
    req: Request,
    store: &dyn ContentStore,
    node_id: NodeId,
) -> Response {
    debug!(method = %req.method, id = req.id, "Handling request");

    match req.method.as_str() {
        "ping" => match serde_json::to_value(PingResult {
            pong: true,
            node_id,
        }) {
            Ok(v) => Response::success(req.id, v),
            Err(e) => Response::error(req.id, error_codes::INTERNAL_ERROR, e.to_string()),
        },

        "has_block" => handle_has_block(req.id, req.params, store).await,

        "get_block" => handle_get_block(req.id, req.params, store).await,

        _ => {
            warn!(method = %req.method, "Unknown method");
            Response::error(
                req.id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {}", req.method),
            )
        }
    }
}

fn parse_address(id: u64, params: Value) -> Result<ContentAddress, Response> {
    serde_json::from_value::<BlockParams>(params)
        .map(|p| p.address)
        .map_err(|e| {
            warn!(id, error = %e, "Invalid block params");
            Response::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("invalid params: {e}"),
            )
        })
}

/// Handle the `has_block` method.
async fn handle_has_block(id: u64, params: Value, store: &dyn ContentStore) -> Response {
    let address = match parse_address(id, params) {
        Ok(address) => address,
        Err(response) => return response,
    };
    match store.has(&address).await {
        Ok(present) => match serde_json::to_value(HasBlockResult { present }) {
            Ok(v) => Response::success(id, v),
            Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
        },
        Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}

/// Handle the `get_block` method.
async fn handle_get_block(id: u64, params: Value, store: &dyn ContentStore) -> Response {
    let address = match parse_address(id, params) {
        Ok(address) => address,
        Err(response) => return response,
    };
    match store.get(&address).await {
        Ok(data) if data.len() > MAX_BLOCK_SIZE => Response::error(
            id,
            error_codes::INTERNAL_ERROR,
            format!("block {address} exceeds {MAX_BLOCK_SIZE} bytes"),
        ),
        Ok(data) => {
            debug!(id, address = %address, size = data.len(), "Serving block");
            match serde_json::to_value(GetBlockResult {
                data: hex::encode(&data),
            }) {
                Ok(v) => Response::success(id, v),
                Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
            }
        }
        Err(StoreError::NotFound(_)) => {
            debug!(id, address = %address, "Block not stored here");
            Response::error(
                id,
                error_codes::BLOCK_NOT_FOUND,
                format!("block not found: {address}"),
            )
        }
        Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}
