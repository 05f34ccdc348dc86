//! Error types for fani-store.

use crate::ContentAddress;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for fani-store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while storing or exchanging blocks.
///
/// The type is `Clone` so a single failed fetch can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No block is stored under the address
    #[error("content not found: {0}")]
    NotFound(ContentAddress),

    /// The block could not be obtained from any source
    #[error("content unavailable: {address}: {reason}")]
    Unavailable {
        /// Requested address
        address: ContentAddress,
        /// Why the lookup failed
        reason: String,
    },

    /// Content did not hash to the requested address
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Address that was requested
        expected: ContentAddress,
        /// Address of the bytes actually received
        actual: ContentAddress,
    },

    /// A string could not be parsed as a content address
    #[error("invalid content address: {0}")]
    InvalidAddress(String),

    /// Writing a block failed
    #[error("write failed: {0}")]
    Write(String),

    /// Failed to reach a peer
    #[error("connection failed: {0}")]
    Connection(String),

    /// JSON-RPC error returned by a peer
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code from the peer
        code: i32,
        /// Error message from the peer
        message: String,
    },

    /// Malformed message on the block exchange protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer did not answer in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl StoreError {
    /// Check if this error is worth retrying.
    ///
    /// Missing content may still arrive from a peer that has not been
    /// reached yet; integrity and format failures never get better.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_)
                | StoreError::Unavailable { .. }
                | StoreError::Connection(_)
                | StoreError::Timeout(_)
                | StoreError::Io(_)
        )
    }

    /// Check if this error indicates missing content.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::Unavailable { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Protocol(e.to_string())
    }
}
