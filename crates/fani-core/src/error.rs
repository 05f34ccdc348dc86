//! Error types for fani-core.

use fani_store::{ContentAddress, StoreError};
use std::fmt;
use thiserror::Error;

/// Result type alias for fani-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while publishing or invoking a function.
///
/// `Clone` so that every caller sharing one bytecode fetch receives the
/// same outcome.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Descriptor could not be decoded or failed validation
    #[error("descriptor invalid: {0}")]
    DescriptorInvalid(String),

    /// Content could not be fetched from the store in time
    #[error("content unavailable: {0}")]
    ContentUnavailable(String),

    /// Fetched content does not hash to the requested address
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Address that was requested
        expected: ContentAddress,
        /// Address of the bytes actually received
        actual: ContentAddress,
    },

    /// Bytecode is malformed or not supported by the sandbox
    #[error("sandbox load error: {0}")]
    SandboxLoad(String),

    /// Bytecode trapped, exceeded a limit, or timed out
    #[error("sandbox execution fault: {0}")]
    SandboxFault(String),

    /// Writing to the store failed
    #[error("publish error: {0}")]
    Publish(String),
}

impl CoreError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::DescriptorInvalid(_) => ErrorKind::DescriptorInvalid,
            CoreError::ContentUnavailable(_) => ErrorKind::ContentUnavailable,
            CoreError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            CoreError::SandboxLoad(_) => ErrorKind::SandboxLoadError,
            CoreError::SandboxFault(_) => ErrorKind::SandboxExecutionFault,
            CoreError::Publish(_) => ErrorKind::PublishError,
        }
    }

    /// Check if this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Map a store write failure.
    pub(crate) fn publish(e: StoreError) -> Self {
        CoreError::Publish(e.to_string())
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::IntegrityMismatch { expected, actual } => {
                CoreError::IntegrityMismatch { expected, actual }
            }
            StoreError::Write(_) => CoreError::Publish(e.to_string()),
            other => CoreError::ContentUnavailable(other.to_string()),
        }
    }
}

/// Error taxonomy reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing descriptor fields.
    DescriptorInvalid,
    /// Store fetch failure or timeout.
    ContentUnavailable,
    /// Fetched content hash differs from the requested address.
    IntegrityMismatch,
    /// Unusable bytecode.
    SandboxLoadError,
    /// Trap, timeout or resource violation during execution.
    SandboxExecutionFault,
    /// Store write failure.
    PublishError,
}

impl ErrorKind {
    /// Only network-class failures are retried, and only at the store boundary.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ContentUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DescriptorInvalid => "DescriptorInvalid",
            ErrorKind::ContentUnavailable => "ContentUnavailable",
            ErrorKind::IntegrityMismatch => "IntegrityMismatch",
            ErrorKind::SandboxLoadError => "SandboxLoadError",
            ErrorKind::SandboxExecutionFault => "SandboxExecutionFault",
            ErrorKind::PublishError => "PublishError",
        };
        f.write_str(name)
    }
}
