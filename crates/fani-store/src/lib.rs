//! # fani-store
//!
//! Content-addressed block storage for fani nodes.
//!
//! Every blob is named by the SHA-256 digest of its bytes. The same bytes
//! always produce the same [`ContentAddress`], and any store handing back
//! content for an address must hand back exactly those bytes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   fani-store (per node)                  │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  NetworkStore   │────▶│  local ContentStore      │   │
//! │  │   - put()       │     │  (FsStore / MemoryStore) │   │
//! │  │   - get()       │     └──────────────────────────┘   │
//! │  └─────────────────┘                  ▲                 │
//! │           │ miss                      │ serves          │
//! │           ▼                           │                 │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  BlockClient    │────▶│  BlockServer (remote)    │   │
//! │  │  - get_block()  │ tcp │  JSON-RPC 2.0, ndjson    │   │
//! │  │  - ping()       │     └──────────────────────────┘   │
//! │  └─────────────────┘                                    │
//! │           ▲                                              │
//! │  ┌─────────────────┐                                    │
//! │  │    PeerSet      │  connected peers, filled by        │
//! │  └─────────────────┘  discovery in fani-core            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use bytes::Bytes;
//! use fani_store::{ContentStore, MemoryStore};
//!
//! # async fn example() -> fani_store::Result<()> {
//! let store = MemoryStore::new();
//! let address = store.put(Bytes::from_static(b"hello")).await?;
//! assert_eq!(store.get(&address).await?, Bytes::from_static(b"hello"));
//! # Ok(())
//! # }
//! ```

mod address;
mod client;
mod error;
mod fs;
mod memory;
mod network;
mod peers;
mod protocol;
mod retry;
mod server;
mod store;

pub use address::ContentAddress;
pub use client::BlockClient;
pub use error::{Result, StoreError};
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use network::NetworkStore;
pub use peers::{NodeId, PeerInfo, PeerSet};
pub use protocol::{error_codes, PingResult, MAX_BLOCK_SIZE};
pub use retry::RetryPolicy;
pub use server::BlockServer;
pub use store::ContentStore;
