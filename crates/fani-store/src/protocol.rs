//! JSON-RPC 2.0 types for the block exchange protocol.
//!
//! Requests and responses are newline-delimited JSON objects over TCP.
//! Block contents travel hex-encoded in the `data` field.

use crate::address::ContentAddress;
use crate::peers::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest block a peer will send or accept (64 MiB).
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Largest single protocol line, sized for a hex-encoded maximal block.
pub(crate) const MAX_LINE_BYTES: u64 = (MAX_BLOCK_SIZE as u64) * 2 + 4096;

/// JSON-RPC 2.0 error codes.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The requested block is not stored on this node.
    pub const BLOCK_NOT_FOUND: i32 = -32004;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version, must be "2.0".
    pub jsonrpc: String,
    /// Request identifier.
    pub id: u64,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Build a request with the given id.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier (matches request).
    pub id: u64,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

/// Result of the `ping` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    /// Always true.
    pub pong: bool,
    /// Identity of the answering node.
    pub node_id: NodeId,
}

/// Parameters for `get_block` and `has_block`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockParams {
    /// Address of the requested block.
    pub address: ContentAddress,
}

/// Result of the `has_block` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct HasBlockResult {
    /// Whether the node stores the block locally.
    pub present: bool,
}

/// Result of the `get_block` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct GetBlockResult {
    /// Hex-encoded block contents.
    pub data: String,
}
