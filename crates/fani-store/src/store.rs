//! The content store contract.

use crate::address::ContentAddress;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Put and get immutable blobs by content address.
///
/// Implementations must be deterministic: `put` of the same bytes always
/// returns the same address, and `get` of an address returns exactly the
/// bytes that hash to it or fails. Empty blobs are valid content.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its address.
    async fn put(&self, data: Bytes) -> Result<ContentAddress>;

    /// Fetch the blob stored under `address`.
    async fn get(&self, address: &ContentAddress) -> Result<Bytes>;

    /// Check whether the blob is available without leaving this node.
    async fn has(&self, address: &ContentAddress) -> Result<bool>;
}
