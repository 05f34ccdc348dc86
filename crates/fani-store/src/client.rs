//! Block exchange client.
//!
//! This module implements the requesting side of the block exchange:
//! a TCP connection to a peer's [`BlockServer`](crate::BlockServer) carrying
//! newline-delimited JSON-RPC messages.

use crate::address::ContentAddress;
use crate::error::StoreError;
use crate::protocol::{
    error_codes, BlockParams, GetBlockResult, HasBlockResult, PingResult, Request, Response,
    MAX_BLOCK_SIZE, MAX_LINE_BYTES,
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Client for requesting blocks from one peer.
pub struct BlockClient {
    addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    next_id: u64,
    rpc_timeout: Duration,
}

impl BlockClient {
    /// Connect to a peer's block server.
    ///
    /// The same `limit` bounds the TCP connect and every later RPC call.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] if the peer does not accept in time,
    /// or [`StoreError::Connection`] if the connection is refused.
    pub async fn connect(addr: SocketAddr, limit: Duration) -> Result<Self, StoreError> {
        tracing::trace!(addr = %addr, "Connecting to peer");
        let stream = match timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(StoreError::Connection(format!("{addr}: {e}")));
            }
            Err(_) => return Err(StoreError::Timeout(limit)),
        };
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        tracing::debug!(addr = %addr, "Connected to peer");
        Ok(Self {
            addr,
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            next_id: 1,
            rpc_timeout: limit,
        })
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send a JSON-RPC request and wait for response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, times out, or the peer returns an error.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
    ) -> Result<R, StoreError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request::new(id, method, serde_json::to_value(params)?);
        let request_str = serde_json::to_string(&request)?;
        tracing::debug!(peer = %self.addr, method = %method, id, "Sending RPC request");

        self.writer.write_all(request_str.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        // Read response with timeout and a cap on line length
        let mut response_str = String::new();
        let mut limited = (&mut self.reader).take(MAX_LINE_BYTES);
        match timeout(self.rpc_timeout, limited.read_line(&mut response_str)).await {
            Ok(Ok(0)) => {
                return Err(StoreError::Connection(format!(
                    "{}: connection closed",
                    self.addr
                )));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(peer = %self.addr, method = %method, id, error = %e, "RPC read error");
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(peer = %self.addr, method = %method, id, timeout_secs = self.rpc_timeout.as_secs(), "RPC response timeout");
                return Err(StoreError::Timeout(self.rpc_timeout));
            }
        }

        let response: Response = serde_json::from_str(&response_str)?;
        if response.id != id {
            return Err(StoreError::Protocol(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }

        if let Some(error) = response.error {
            tracing::debug!(peer = %self.addr, method = %method, id, code = error.code, message = %error.message, "RPC error response");
            return Err(StoreError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        let result = response
            .result
            .ok_or_else(|| StoreError::Protocol("missing result in response".into()))?;

        tracing::trace!(peer = %self.addr, method = %method, id, "RPC call successful");
        serde_json::from_value(result).map_err(StoreError::from)
    }

    /// Ping the peer, returning its identity.
    pub async fn ping(&mut self) -> Result<PingResult, StoreError> {
        self.call("ping", serde_json::json!({})).await
    }

    /// Ask whether the peer stores a block locally.
    pub async fn has_block(&mut self, address: &ContentAddress) -> Result<bool, StoreError> {
        let resp: HasBlockResult = self
            .call("has_block", BlockParams { address: *address })
            .await?;
        Ok(resp.present)
    }

    /// Fetch a block from the peer.
    ///
    /// The returned bytes are checked against `address`; a peer sending
    /// anything else produces [`StoreError::IntegrityMismatch`].
    pub async fn get_block(&mut self, address: &ContentAddress) -> Result<Bytes, StoreError> {
        let resp: GetBlockResult = match self
            .call("get_block", BlockParams { address: *address })
            .await
        {
            Ok(resp) => resp,
            Err(StoreError::Rpc { code, .. }) if code == error_codes::BLOCK_NOT_FOUND => {
                return Err(StoreError::NotFound(*address));
            }
            Err(e) => return Err(e),
        };

        if resp.data.len() > MAX_BLOCK_SIZE * 2 {
            return Err(StoreError::Protocol(format!(
                "block {address} exceeds {MAX_BLOCK_SIZE} bytes"
            )));
        }
        let data = hex::decode(&resp.data)
            .map_err(|e| StoreError::Protocol(format!("invalid block encoding: {e}")))?;
        address.verify(&data)?;

        tracing::debug!(peer = %self.addr, address = %address, size = data.len(), "Received block");
        Ok(Bytes::from(data))
    }
}
