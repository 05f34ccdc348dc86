//! Function descriptor document and its codec.
//!
//! A descriptor names a function, points at its bytecode and declares its
//! arguments. It is stored as JSON and addressed by the hash of that JSON:
//!
//! ```json
//! { "id": "helloworld", "bytecode": "<hex address>",
//!   "args": [ { "name": "toGreet", "codec": "<hex address>", "data": "<hex address>" } ] }
//! ```

use crate::error::{CoreError, Result};
use bytes::Bytes;
use fani_store::{ContentAddress, ContentStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Largest encoded descriptor accepted on decode (1 MiB).
pub const MAX_DESCRIPTOR_SIZE: usize = 1024 * 1024;

/// Published description of a callable function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    /// Human-readable name.
    pub id: String,
    /// Address of the WebAssembly module.
    pub bytecode: ContentAddress,
    /// Declared arguments, possibly empty.
    #[serde(default)]
    pub args: Vec<ArgumentSpec>,
}

/// A declared argument of a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,
    /// Address of the codec describing how `data` is encoded.
    pub codec: ContentAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ContentAddress>,
}

impl FunctionDescriptor {
    /// Create a descriptor with no declared arguments.
    pub fn new(id: impl Into<String>, bytecode: ContentAddress) -> Self {
        Self {
            id: id.into(),
            bytecode,
            args: Vec::new(),
        }
    }

    /// Add a declared argument.
    pub fn with_arg(mut self, arg: ArgumentSpec) -> Self {
        self.args.push(arg);
        self
    }

    /// Check the invariants serde cannot express.
    ///
    /// The bytecode address is already well-formed by construction; here
    /// we check the id and the argument names.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::DescriptorInvalid("id must not be empty".into()));
        }

        let mut seen = HashSet::with_capacity(self.args.len());
        for (index, arg) in self.args.iter().enumerate() {
            if arg.name.trim().is_empty() {
                return Err(CoreError::DescriptorInvalid(format!(
                    "argument {index} has an empty name"
                )));
            }
            if !seen.insert(arg.name.as_str()) {
                return Err(CoreError::DescriptorInvalid(format!(
                    "duplicate argument name: {}",
                    arg.name
                )));
            }
        }

        Ok(())
    }
}

/// Encodes, decodes and publishes descriptors against a content store.
#[derive(Clone)]
pub struct DescriptorCodec {
    store: Arc<dyn ContentStore>,
}

impl DescriptorCodec {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Encode a descriptor to its wire form.
    pub fn encode(descriptor: &FunctionDescriptor) -> Result<Bytes> {
        descriptor.validate()?;
        serde_json::to_vec(descriptor)
            .map(Bytes::from)
            .map_err(|e| CoreError::DescriptorInvalid(format!("encode failed: {e}")))
    }

    /// Decode and validate a descriptor from its wire form.
    pub fn decode(data: &[u8]) -> Result<FunctionDescriptor> {
        if data.len() > MAX_DESCRIPTOR_SIZE {
            return Err(CoreError::DescriptorInvalid(format!(
                "descriptor is {} bytes, limit is {MAX_DESCRIPTOR_SIZE}",
                data.len()
            )));
        }

        let descriptor: FunctionDescriptor = serde_json::from_slice(data)
            .map_err(|e| CoreError::DescriptorInvalid(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Fetch and decode the descriptor stored at `address`.
    pub async fn resolve(&self, address: &ContentAddress) -> Result<FunctionDescriptor> {
        let data = self.store.get(address).await?;
        let descriptor = Self::decode(&data)?;
        tracing::debug!(address = %address, id = %descriptor.id, args = descriptor.args.len(), "Resolved descriptor");
        Ok(descriptor)
    }

    /// Encode and store a descriptor, returning its address.
    pub async fn publish(&self, descriptor: &FunctionDescriptor) -> Result<ContentAddress> {
        let encoded = Self::encode(descriptor)?;
        self.store.put(encoded).await.map_err(CoreError::publish)
    }
}
