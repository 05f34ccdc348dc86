//! Per-node state shared by every invocation.

use crate::cache::BytecodeCache;
use crate::discovery::DiscoveryStats;
use crate::orchestrator::{InputAssembly, StageTimeouts};
use crate::sandbox::ExecutionSandbox;
use fani_store::{ContentStore, NodeId, PeerSet};
use std::sync::Arc;

/// Everything an [`Orchestrator`](crate::Orchestrator) needs, built once at
/// startup and shared by `Arc`.
pub struct NodeContext {
    node_id: NodeId,
    store: Arc<dyn ContentStore>,
    cache: Arc<BytecodeCache>,
    sandbox: Arc<dyn ExecutionSandbox>,
    peers: PeerSet,
    discovery: Option<Arc<DiscoveryStats>>,
    timeouts: StageTimeouts,
    input_assembly: InputAssembly,
}

impl NodeContext {
    /// Start building a context from its three required collaborators.
    pub fn builder(
        store: Arc<dyn ContentStore>,
        cache: Arc<BytecodeCache>,
        sandbox: Arc<dyn ExecutionSandbox>,
    ) -> NodeContextBuilder {
        NodeContextBuilder {
            context: NodeContext {
                node_id: NodeId::new(),
                store,
                cache,
                sandbox,
                peers: PeerSet::new(),
                discovery: None,
                timeouts: StageTimeouts::default(),
                input_assembly: InputAssembly::default(),
            },
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn cache(&self) -> &BytecodeCache {
        &self.cache
    }

    pub fn sandbox(&self) -> &dyn ExecutionSandbox {
        self.sandbox.as_ref()
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Discovery counters, when discovery is running.
    pub fn discovery(&self) -> Option<&DiscoveryStats> {
        self.discovery.as_deref()
    }

    pub fn timeouts(&self) -> &StageTimeouts {
        &self.timeouts
    }

    pub fn input_assembly(&self) -> InputAssembly {
        self.input_assembly
    }
}

/// Builder for [`NodeContext`].
pub struct NodeContextBuilder {
    context: NodeContext,
}

impl NodeContextBuilder {
    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.context.node_id = node_id;
        self
    }

    /// Use a peer set shared with the store and discovery.
    pub fn peers(mut self, peers: PeerSet) -> Self {
        self.context.peers = peers;
        self
    }

    pub fn discovery(mut self, stats: Arc<DiscoveryStats>) -> Self {
        self.context.discovery = Some(stats);
        self
    }

    pub fn timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.context.timeouts = timeouts;
        self
    }

    pub fn input_assembly(mut self, input_assembly: InputAssembly) -> Self {
        self.context.input_assembly = input_assembly;
        self
    }

    pub fn build(self) -> NodeContext {
        self.context
    }
}
