//! # fani-core
//!
//! Function invocation orchestration for fani nodes.
//!
//! A function compiled to WebAssembly is published once into the
//! content-addressed store and can then be invoked by any node that can
//! resolve its address. This crate resolves descriptors, materializes
//! bytecode and arguments, drives a sandboxed execution and publishes the
//! result as new content.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     fani-core (node)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  Orchestrator   │────▶│  DescriptorCodec         │   │
//! │  │   - deploy()    │     │  (JSON, decode+validate) │   │
//! │  │   - call()      │     └──────────────────────────┘   │
//! │  │   - execute()   │     ┌──────────────────────────┐   │
//! │  └─────────────────┘────▶│  BytecodeCache           │   │
//! │           │              │  (single-flight, on disk)│   │
//! │           │              └──────────────────────────┘   │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ ExecutionSandbox│────▶│  wasmtime run <module>   │   │
//! │  │ (ProcessSandbox)│     │  stdin → stdout          │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │                                                          │
//! │  NodeContext: store, cache, sandbox, peers, timeouts     │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │           fani-store (NetworkStore + BlockServer)        │
//! │      peers found by LAN discovery and bootstrap list     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use bytes::Bytes;
//! use fani_core::{Node, NodeConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::start(NodeConfig::from_env()).await?;
//! let orchestrator = node.orchestrator();
//!
//! // Publish a module
//! let wasm = Bytes::from(std::fs::read("hello.wasm")?);
//! let function = orchestrator.deploy(wasm, "helloworld").await?;
//!
//! // Invoke it with one argument and read the published result
//! let arg = orchestrator.context().store().put(Bytes::from_static(b"world")).await?;
//! let result = orchestrator.call(&function, &[arg]).await?;
//! let output = orchestrator.context().store().get(&result).await?;
//!
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod node;
pub mod orchestrator;
pub mod sandbox;

pub use cache::{BytecodeCache, CacheEntry, CacheStats};
pub use config::{ConfigError, NodeConfig};
pub use context::{NodeContext, NodeContextBuilder};
pub use descriptor::{ArgumentSpec, DescriptorCodec, FunctionDescriptor, MAX_DESCRIPTOR_SIZE};
pub use discovery::{DiscoveryStats, PeerDiscovery, PeerFound, PeerQueue};
pub use error::{CoreError, ErrorKind, Result};
pub use node::{Node, NodeError};
pub use orchestrator::{CallState, InputAssembly, InvocationError, Orchestrator, StageTimeouts};
pub use sandbox::{
    ExecutionResult, ExecutionSandbox, ModuleHandle, ProcessSandbox, SandboxConfig,
    MAX_OUTPUT_SIZE,
};
